//! TCP client for the router's call-monitor service. The service is enabled
//! on the device by dialing `#96*5*` and emits one newline-terminated record
//! per call-lifecycle step.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::event::CallEvent;

mod parser;
pub use parser::RecordParser;


pub type CallEventSender = mpsc::UnboundedSender<CallEvent>;
pub type CallEventReceiver = mpsc::UnboundedReceiver<CallEvent>;

pub type ParseErrorSender = mpsc::UnboundedSender<anyhow::Error>;
pub type ParseErrorReceiver = mpsc::UnboundedReceiver<anyhow::Error>;

/// Connects to the call-monitor port and turns the record stream into typed
/// events. The parser state lives across reconnects so a lifecycle spanning
/// a brief socket drop keeps its context.
pub struct MonitorClient {
    host: String,
    port: u16,
    parser: RecordParser,
}

impl MonitorClient {
    pub fn new(config: &Config) -> Result<Self> {
        let tz = config.timezone()?;
        Ok(Self {
            host: config.router.host.clone(),
            port: config.router.port,
            parser: RecordParser::new(
                tz,
                config.pbx.country_code.clone(),
                config.pbx.local_area_code.clone(),
                config.pbx.msn.clone(),
            ),
        })
    }

    pub async fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        TcpStream::connect(&addr)
            .await
            .with_context(|| format!("failed to connect to call monitor at {}", addr))
    }

    /// Reads records until the peer closes, an IO error occurs or the token
    /// fires. Parse errors are reported on the error channel and the record
    /// is dropped; they never stop the reader or reach the engine.
    pub async fn run(
        &mut self,
        stream: TcpStream,
        events: CallEventSender,
        errors: ParseErrorSender,
        token: CancellationToken,
    ) -> Result<()> {
        let mut lines = BufReader::new(stream).lines();

        loop {
            select! {
                _ = token.cancelled() => return Ok(()),
                line = lines.next_line() => {
                    let line = match line.context("error reading from call monitor")? {
                        Some(line) => line,
                        None => bail!("call monitor connection closed by router"),
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match self.parser.parse(&line) {
                        Ok(event) => {
                            debug!(
                                line = event.line,
                                event_type = event.event_type.as_str(),
                                call_id = %event.id,
                                "parsed call monitor record"
                            );
                            if events.send(event).is_err() {
                                // Engine is gone; shutting down.
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            let _ = errors.send(e);
                        }
                    }
                }
            }
        }
    }
}
