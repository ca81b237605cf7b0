use std::time::Duration;

use clap::Parser;
use hermod::driver::Resolver;
use hermod::wire::MessageView;
use hermod::{ChannelOptions, RecordClass, RecordType, ServerSpec};
use tracing_subscriber::EnvFilter;

/// Resolve a name against the configured DNS servers and print a summary of
/// the raw answer.
#[derive(Parser, Debug)]
#[command(name = "hermod-dig")]
struct Args {
    /// Name to resolve
    name: String,

    /// Record type: A, AAAA, MX, TXT, ... or a numeric code
    #[arg(default_value = "A")]
    rtype: RecordType,

    /// Upstream server, e.g. 1.1.1.1 or [8.8.8.8]:5353 (repeatable).
    /// Defaults to the platform resolver configuration.
    #[arg(short, long)]
    server: Vec<ServerSpec>,

    /// Per-try timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Tries per server
    #[arg(long)]
    tries: Option<u32>,

    /// Send the query over TCP from the first try
    #[arg(long)]
    tcp: bool,

    /// Do not advertise EDNS
    #[arg(long)]
    no_edns: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let options = ChannelOptions {
        servers: (!args.server.is_empty()).then(|| args.server.clone()),
        timeout: args.timeout_ms.map(Duration::from_millis),
        tries: args.tries,
        edns: args.no_edns.then_some(false),
        use_tcp_only: args.tcp,
        ..Default::default()
    };

    let mut resolver = match Resolver::new(options) {
        Ok(resolver) => resolver,
        Err(err) => {
            eprintln!("hermod-dig: {}", err);
            std::process::exit(2);
        }
    };

    let outcome = resolver.query(&args.name, args.rtype, RecordClass::IN).await;
    match outcome.result {
        Ok(payload) => {
            let view = match MessageView::parse(&payload) {
                Ok(view) => view,
                Err(err) => {
                    eprintln!("hermod-dig: unreadable answer: {}", err);
                    std::process::exit(1);
                }
            };
            println!(
                ";; rcode {} answers {} authority {} additional {} ({} bytes, {} timeouts)",
                view.rcode(),
                view.ancount(),
                view.nscount(),
                view.arcount(),
                payload.len(),
                outcome.timeouts
            );
            if let Ok(questions) = view.questions() {
                for question in questions {
                    println!(
                        ";; question {} type {} class {}",
                        question.name, question.rtype, question.rclass
                    );
                }
            }
        }
        Err(err) => {
            eprintln!("{}: {} ({} timeouts)", args.name, err, outcome.timeouts);
            std::process::exit(1);
        }
    }
}
