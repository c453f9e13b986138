// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! termhubd: a thin executable that binds a WebSocket listener to
//! termhub-core's terminal-multiplexing Session Manager. This binary
//! is the only place a process-wide [`SessionManager`] is constructed;
//! everything else in this lineage takes it by reference.

use std::{cell::RefCell, io, net::TcpListener, rc::Rc, sync::Arc, thread};

use clap::Parser;
use termhub_core::{
    daemon::{endpoint::serve_connection, signals::install_shutdown_handler},
    SessionManager,
};
use tracing::{info, warn};
use tracing_subscriber::fmt::format::FmtSpan;

/// Command line arguments `termhubd` expects.
#[derive(Parser, Debug)]
#[clap(author, about)]
struct Args {
    #[clap(short, long, default_value = "127.0.0.1:7670", help = "Address to listen for WebSocket connections on")]
    listen: String,

    #[clap(short, long, help = "A toml file containing configuration")]
    config_file: Option<String>,

    #[clap(short, long, action = clap::ArgAction::Count, help = "Show more in logs, may be provided multiple times")]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let cfg = termhub_core::read_config(&args.config_file)?;
    let manager = SessionManager::new(cfg)?;
    install_shutdown_handler(Arc::clone(&manager))?;

    let listener = TcpListener::bind(&args.listen)?;
    info!(addr = %args.listen, "termhubd listening");

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!("error accepting connection: {}", e);
                continue;
            }
        };
        let manager = Arc::clone(&manager);
        thread::Builder::new()
            .name("conn-accept".to_string())
            .spawn(move || {
                if let Err(e) = stream.set_read_timeout(Some(termhub_core::consts::WS_READ_POLL_INTERVAL)) {
                    warn!("error setting socket read timeout: {}", e);
                    return;
                }
                let client_id = Rc::new(RefCell::new(None));
                let client_id_for_cb = Rc::clone(&client_id);
                let handshake = tungstenite::accept_hdr(stream, move |req: &tungstenite::handshake::server::Request, resp| {
                    *client_id_for_cb.borrow_mut() = extract_client_id(req);
                    Ok(resp)
                });

                let ws = match handshake {
                    Ok(ws) => ws,
                    Err(e) => {
                        warn!("websocket handshake failed: {}", e);
                        return;
                    }
                };

                let client_id = client_id.borrow().clone();
                let client_id = match client_id {
                    Some(id) if termhub_core::ids::is_valid_client_id(&id) => id,
                    _ => {
                        let mut ws = ws;
                        let _ = tungstenite::WebSocket::close(&mut ws, None);
                        warn!("rejecting connection with missing or invalid client id");
                        return;
                    }
                };

                serve_connection(manager, client_id, Box::new(ws));
            })
            .expect("spawning connection handler thread");
    }

    Ok(())
}

/// Pull a client identifier out of an `x-client-id` header, falling
/// back to a `client_id` query parameter on the handshake path.
fn extract_client_id(req: &tungstenite::handshake::server::Request) -> Option<String> {
    if let Some(value) = req.headers().get("x-client-id") {
        if let Ok(s) = value.to_str() {
            return Some(s.to_string());
        }
    }
    let path = req.uri().path_and_query()?.as_str();
    let query = path.split_once('?')?.1;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("client_id=") {
            return Some(value.to_string());
        }
    }
    None
}

fn init_tracing(verbose: u8) {
    let level = if verbose == 0 {
        tracing::Level::INFO
    } else if verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(io::stderr)
        .init();
}
