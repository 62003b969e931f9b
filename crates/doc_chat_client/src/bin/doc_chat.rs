//! doc-chat: ask one question over the chat WebSocket.
//! Reads config, connects, sends the question, prints the streamed answer and
//! its citations to stdout.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};

use clap::Parser;
use doc_chat_client::{config, ChatEngine, Citation, ClientEvent, Handlers, Scope, UserMessage};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "doc-chat", about = "Ask a question about your documents")]
struct Args {
    /// Question to ask; read from stdin when omitted.
    question: Option<String>,

    /// Config file (default: ~/.doc-chat/config.yaml).
    #[arg(long, env = "DOC_CHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Conversation to continue; 0 starts a new one.
    #[arg(long, default_value_t = 0)]
    conversation: u64,

    /// Restrict retrieval to this document id. Repeatable.
    #[arg(long = "doc")]
    docs: Vec<u64>,

    #[arg(long)]
    k_vec: Option<u32>,

    #[arg(long)]
    k_text: Option<u32>,

    /// Also run full-text retrieval.
    #[arg(long)]
    use_text: bool,
}

#[derive(Debug, Default)]
struct Outcome {
    streamed: bool,
    error: Option<String>,
}

fn resolve_config_path(args: &Args) -> PathBuf {
    if let Some(path) = &args.config {
        return path.clone();
    }
    config::default_config_path().unwrap_or_else(|| {
        eprintln!("Error: unable to determine config path (set --config or DOC_CHAT_CONFIG)");
        process::exit(1);
    })
}

fn read_question(args: &Args) -> String {
    if let Some(q) = &args.question {
        return q.trim().to_string();
    }
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).unwrap_or(0);
    line.trim().to_string()
}

fn citation_label(c: &Citation) -> String {
    let mut label = format!("doc {} chunk {}", c.doc_id, c.chunk_id);
    if let Some(start) = c.page_start {
        match c.page_end {
            Some(end) if end != start => label.push_str(&format!(" p{}-{}", start, end)),
            _ => label.push_str(&format!(" p{}", start)),
        }
    }
    if let Some(section) = &c.section_path {
        label.push_str(&format!(" ({})", section));
    }
    label.push_str(&format!(" score {:.2}", c.score));
    label
}

fn handlers(outcome: Arc<Mutex<Outcome>>) -> Handlers {
    let on_delta = outcome.clone();
    let on_done = outcome.clone();
    let on_error = outcome;
    Handlers::new()
        .on_conversation_assigned(|a| eprintln!("conversation: {}", a.conversation_id))
        .on_delta(move |_, delta| {
            if let Ok(mut o) = on_delta.lock() {
                o.streamed = true;
            }
            let mut out = io::stdout().lock();
            let _ = write!(out, "{}", delta);
            let _ = out.flush();
        })
        .on_done(move |done| {
            let streamed = on_done.lock().map(|o| o.streamed).unwrap_or(false);
            let mut out = io::stdout().lock();
            if !streamed {
                let _ = write!(out, "{}", done.content);
            }
            let _ = writeln!(out);
            if !done.citations.is_empty() {
                let _ = writeln!(out, "\nSources:");
                for c in &done.citations {
                    let _ = writeln!(out, "  {}", citation_label(c));
                }
            }
        })
        .on_error(move |e| {
            if let Ok(mut o) = on_error.lock() {
                o.error.get_or_insert_with(|| e.detail.clone());
            }
        })
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config_path = resolve_config_path(&args);
    let cfg = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: failed to load config from {}: {}", config_path.display(), e);
            process::exit(1);
        }
    };

    let question = read_question(&args);
    if question.is_empty() {
        eprintln!("Error: no question provided");
        process::exit(1);
    }

    let scope = if args.docs.is_empty() {
        Scope::all()
    } else {
        Scope::selected(args.docs.clone()).unwrap_or_default()
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Error: failed to create runtime: {}", e);
            process::exit(1);
        });

    let code = rt.block_on(async {
        let outcome = Arc::new(Mutex::new(Outcome::default()));
        let mut engine = match ChatEngine::from_config(&cfg, handlers(outcome.clone())) {
            Ok(engine) => engine,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };

        if let Err(e) = engine.open().await {
            eprintln!("Error: connection failed: {}", e);
            return 1;
        }

        let request_id = engine.next_request_id();
        let mut message = UserMessage::new(request_id.clone(), args.conversation, question);
        message.scope = scope;
        message.k_vec = args.k_vec.unwrap_or(cfg.retrieval.k_vec);
        message.k_text = args.k_text.unwrap_or(cfg.retrieval.k_text);
        message.use_text = args.use_text || cfg.retrieval.use_text;

        if let Err(e) = engine.send(ClientEvent::UserMessage(message)) {
            eprintln!("Error: send failed: {}", e);
            return 1;
        }

        let timeout = cfg.connection.request_timeout();
        let finished = tokio::time::timeout(timeout, async {
            while engine.is_pending(&request_id) {
                if !engine.process_next().await {
                    break;
                }
            }
        })
        .await;
        if finished.is_err() {
            engine.dispose(&request_id);
            eprintln!("Error: no answer within {:?}", timeout);
            return 1;
        }
        engine.shutdown();

        let error = outcome.lock().ok().and_then(|o| o.error.clone());
        match error {
            Some(detail) => {
                eprintln!("Server error: {}", detail);
                1
            }
            None => 0,
        }
    });
    process::exit(code);
}
