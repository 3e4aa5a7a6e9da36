//! Connection manager: the IO task owning the transport
//!
//! One task per engine. It writes queued lines in order, frames and
//! dispatches everything the device sends, sweeps overdue requests on a
//! tick, and on any connection failure reconnects with backoff until a
//! shutdown is requested. The transport is handed back when the task ends
//! so a later `connect()` can reuse it.

use crate::dispatch::{Dispatcher, Outbound};
use ecp_core::{EcpError, EcpResult};
use ecp_session::LineFramer;
use ecp_transport::TransportLayer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

const READ_CHUNK_SIZE: usize = 4096;

/// Why a session ended
#[derive(Debug)]
enum SessionExit {
    Shutdown,
    Lost(EcpError),
}

/// Marks the connection closed when the IO task ends, by return or by panic
struct CloseOnExit {
    dispatcher: Arc<Dispatcher>,
    clean: bool,
}

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        if !self.clean {
            log::error!("IO task stopped unexpectedly; failing outstanding requests");
        }
        self.dispatcher.closed();
    }
}

/// Body of the IO task
pub(crate) async fn run(
    dispatcher: Arc<Dispatcher>,
    mut transport: Box<dyn TransportLayer>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> Box<dyn TransportLayer> {
    let mut close_on_exit = CloseOnExit {
        dispatcher: Arc::clone(&dispatcher),
        clean: false,
    };
    let endpoint = transport.endpoint();
    let mut framer = LineFramer::new(dispatcher.config.max_line_length);

    loop {
        let exit = session(&dispatcher, transport.as_mut(), &mut framer, &mut outbound).await;
        if let Err(e) = transport.close().await {
            log::debug!("closing {} failed: {}", endpoint, e);
        }
        framer.reset();

        let reason = match exit {
            SessionExit::Shutdown => break,
            SessionExit::Lost(reason) => reason,
        };
        log::warn!("connection to {} lost: {}", endpoint, reason);
        dispatcher.connection_lost(&reason);
        if discard_queued(&mut outbound) {
            break;
        }

        if !reconnect(&dispatcher, transport.as_mut(), &mut outbound).await {
            break;
        }
        dispatcher.statistics.increment_reconnects();
        log::info!("reconnected to {}", endpoint);
        dispatcher.establish();
    }

    close_on_exit.clean = true;
    log::info!("connection to {} closed", endpoint);
    transport
}

async fn session(
    dispatcher: &Dispatcher,
    transport: &mut dyn TransportLayer,
    framer: &mut LineFramer,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> SessionExit {
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    let mut tick = tokio::time::interval(dispatcher.config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            message = outbound.recv() => match message {
                Some(Outbound::Line(line)) => {
                    if let Err(e) = write_line(dispatcher, transport, &line).await {
                        return SessionExit::Lost(e);
                    }
                }
                Some(Outbound::Shutdown) | None => return SessionExit::Shutdown,
            },
            read = transport.read(&mut buffer) => match read {
                Ok(0) => return SessionExit::Lost(EcpError::disconnected("connection closed by device")),
                Ok(n) => {
                    framer.extend(&buffer[..n]);
                    let boundary = transport.at_message_boundary();
                    if let Err(e) = dispatch_lines(dispatcher, framer, boundary) {
                        return SessionExit::Lost(e);
                    }
                }
                Err(e) => return SessionExit::Lost(e),
            },
            _ = tick.tick() => dispatcher.expire_overdue(Instant::now()),
        }
    }
}

async fn write_line(
    dispatcher: &Dispatcher,
    transport: &mut dyn TransportLayer,
    line: &str,
) -> EcpResult<()> {
    log::debug!("-> {}", line);
    let terminator = dispatcher.config.line_terminator.as_bytes();
    let mut bytes = Vec::with_capacity(line.len() + terminator.len());
    bytes.extend_from_slice(line.as_bytes());
    bytes.extend_from_slice(terminator);

    transport.write_all(&bytes).await?;
    transport.flush().await?;
    dispatcher.statistics.increment_commands_sent();
    Ok(())
}

/// Dispatch every complete line; at a datagram boundary the remainder is a
/// line of its own even without a terminator
fn dispatch_lines(dispatcher: &Dispatcher, framer: &mut LineFramer, boundary: bool) -> EcpResult<()> {
    for line in framer.lines() {
        dispatch_framed(dispatcher, line)?;
    }
    if boundary {
        if let Some(line) = framer.flush_partial() {
            dispatch_framed(dispatcher, line)?;
        }
    }
    Ok(())
}

fn dispatch_framed(dispatcher: &Dispatcher, line: EcpResult<String>) -> EcpResult<()> {
    match line {
        Ok(line) => {
            dispatcher.dispatch_line(&line);
            Ok(())
        }
        Err(e) => {
            dispatcher.statistics.increment_framing_errors();
            Err(e)
        }
    }
}

/// Drop lines queued for the lost connection; `true` if a shutdown was among them
fn discard_queued(outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> bool {
    let mut shutdown = false;
    while let Ok(message) = outbound.try_recv() {
        match message {
            Outbound::Line(line) => log::debug!("discarding queued line {:?}", line),
            Outbound::Shutdown => shutdown = true,
        }
    }
    shutdown
}

/// Retry `open()` with backoff; `false` when a shutdown interrupted it
async fn reconnect(
    dispatcher: &Dispatcher,
    transport: &mut dyn TransportLayer,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> bool {
    let endpoint = transport.endpoint();
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        let delay = dispatcher.config.backoff.delay(attempt);
        log::info!("reconnecting to {} in {:?} (attempt {})", endpoint, delay, attempt);
        if !wait_unless_shutdown(delay, outbound).await {
            return false;
        }
        if !dispatcher.begin_connecting() {
            return false;
        }

        let opened = open_unless_shutdown(transport, dispatcher.config.connect_timeout, outbound).await;
        match opened {
            Some(Ok(Ok(()))) => return true,
            Some(Ok(Err(e))) => log::warn!("reconnect to {} failed: {}", endpoint, e),
            Some(Err(_)) => log::warn!("reconnect to {} timed out", endpoint),
            None => {
                log::debug!("reconnect to {} abandoned on close", endpoint);
                let _ = transport.close().await;
                return false;
            }
        }
        let _ = transport.close().await;
        dispatcher.connect_failed();
    }
}

/// One bounded `open()`; `None` if a shutdown arrived first
async fn open_unless_shutdown(
    transport: &mut dyn TransportLayer,
    limit: Duration,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Option<Result<EcpResult<()>, tokio::time::error::Elapsed>> {
    let open = tokio::time::timeout(limit, transport.open());
    tokio::pin!(open);
    loop {
        tokio::select! {
            biased;

            message = outbound.recv() => match message {
                Some(Outbound::Line(line)) => log::debug!("discarding queued line {:?}", line),
                Some(Outbound::Shutdown) | None => return None,
            },
            opened = &mut open => return Some(opened),
        }
    }
}

/// Sleep for `delay`; `false` if a shutdown arrived first
///
/// Requests cannot be queued while disconnected, so anything else on the
/// queue is a leftover from the lost connection.
async fn wait_unless_shutdown(delay: Duration, outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            biased;

            message = outbound.recv() => match message {
                Some(Outbound::Line(line)) => log::debug!("discarding queued line {:?}", line),
                Some(Outbound::Shutdown) | None => return false,
            },
            _ = &mut sleep => return true,
        }
    }
}
