//! Loopback pump: a producer thread streams a payload through a
//! [`SharedOutputBuffer`] into a managed session over an in-memory
//! transport, while a simulated peer drains a bounded window per reactor
//! cycle.

use crate::config::PumpConfig;
use crate::{component_debug, component_info, component_warn};
use anyhow::{Context, Result};
use nio_buffer::{BufferError, DataStreamChannel, SharedOutputBuffer};
use nio_session::{
    EventMask, IoEventHandler, IoSession, ManagedSession, MemorySession, SessionError,
    SessionRegistry,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Greeting the peer sends before the payload starts flowing
const REQUEST: &[u8] = b"GET /payload\r\n";

/// Outcome of a pump run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpReport {
    pub bytes_sent: usize,
    pub bytes_received: usize,
    pub request_bytes: usize,
    pub output_cycles: usize,
    pub released_sessions: usize,
    pub elapsed: Duration,
}

/// Byte `i` of the generated payload
fn payload_byte(i: usize) -> u8 {
    (i % 251) as u8
}

/// Verify bytes the peer received starting at `offset`, returning their count
fn check_payload(chunk: &[u8], offset: usize) -> Result<usize> {
    if let Some(pos) = chunk
        .iter()
        .enumerate()
        .position(|(i, b)| *b != payload_byte(offset + i))
    {
        anyhow::bail!("payload corrupted at byte {}", offset + pos);
    }
    Ok(chunk.len())
}

/// Sink writing into the managed session's effective channel
struct SessionSink {
    session: Weak<ManagedSession>,
    ended: AtomicBool,
}

impl SessionSink {
    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

impl DataStreamChannel for SessionSink {
    fn write(&self, src: &[u8]) -> io::Result<usize> {
        let session = self
            .session
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "session released"))?;
        session.channel().write(src)
    }

    fn end_stream(&self) -> io::Result<()> {
        self.ended.store(true, Ordering::Release);
        Ok(())
    }

    fn request_output(&self) {
        if let Some(session) = self.session.upgrade() {
            session.set_event(EventMask::WRITE);
        }
    }
}

/// Protocol handler: reads the request, then flushes the shared buffer on every output cycle
struct PumpHandler {
    buffer: Arc<SharedOutputBuffer>,
    sink: Arc<SessionSink>,
    request_bytes: AtomicUsize,
    output_cycles: AtomicUsize,
}

fn buffer_error(err: BufferError) -> SessionError {
    match err {
        BufferError::Io(e) => SessionError::Io(e),
        BufferError::Aborted => SessionError::Handler("output aborted".into()),
    }
}

impl IoEventHandler for PumpHandler {
    fn connected(&self, session: &dyn IoSession) -> Result<(), SessionError> {
        component_debug!("pump", "Session {} connected", session.id());
        session.set_event(EventMask::READ);
        Ok(())
    }

    fn input_ready(&self, session: &dyn IoSession) -> Result<(), SessionError> {
        let mut buf = [0u8; 256];
        loop {
            match session.channel().read(&mut buf) {
                Ok(0) => {
                    session.clear_event(EventMask::READ);
                    break;
                }
                Ok(n) => {
                    self.request_bytes.fetch_add(n, Ordering::Relaxed);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        if self.request_bytes.load(Ordering::Relaxed) >= REQUEST.len() {
            session.set_event(EventMask::WRITE);
        }
        Ok(())
    }

    fn output_ready(&self, session: &dyn IoSession) -> Result<(), SessionError> {
        self.output_cycles.fetch_add(1, Ordering::Relaxed);
        self.buffer
            .flush(Arc::clone(&self.sink) as Arc<dyn DataStreamChannel>)
            .map_err(buffer_error)?;
        if self.sink.is_ended() {
            component_info!("pump", "Payload complete on {}, closing", session.id());
            session.clear_event(EventMask::WRITE);
            session.close();
        }
        Ok(())
    }

    fn timeout(&self, session: &dyn IoSession) -> Result<(), SessionError> {
        component_warn!("pump", "Session {} idle, aborting output", session.id());
        self.buffer.abort();
        session.shutdown();
        Ok(())
    }

    fn exception(&self, session: &dyn IoSession, cause: &io::Error) {
        component_warn!("pump", "I/O failure on {}: {}", session.id(), cause);
        self.buffer.abort();
    }

    fn disconnected(&self, session: &dyn IoSession) {
        component_debug!("pump", "Session {} disconnected", session.id());
    }
}

/// Run the pump to completion or until `deadline` elapses
pub fn run(config: &PumpConfig, deadline: Duration) -> Result<PumpReport> {
    let started = Instant::now();
    let registry = SessionRegistry::new(config.session.clone());

    let remote: SocketAddr = "127.0.0.1:40001".parse()?;
    let local: SocketAddr = "127.0.0.1:8080".parse()?;
    let raw = Arc::new(MemorySession::new(Some(remote), Some(local)));
    let session = registry.register(None, raw.clone());

    let buffer = Arc::new(SharedOutputBuffer::new(config.session.buffer_size));
    let handler = Arc::new(PumpHandler {
        buffer: Arc::clone(&buffer),
        sink: Arc::new(SessionSink {
            session: Arc::downgrade(&session),
            ended: AtomicBool::new(false),
        }),
        request_bytes: AtomicUsize::new(0),
        output_cycles: AtomicUsize::new(0),
    });
    session.set_handler(handler.clone());
    session.on_connected()?;

    let producer = {
        let buffer = Arc::clone(&buffer);
        let total = config.payload_bytes;
        let chunk_size = config.chunk_size;
        thread::Builder::new()
            .name("nio-producer".into())
            .spawn(move || -> Result<usize, BufferError> {
                let mut chunk = Vec::with_capacity(chunk_size);
                let mut offset = 0;
                while offset < total {
                    let len = chunk_size.min(total - offset);
                    chunk.clear();
                    chunk.extend((offset..offset + len).map(payload_byte));
                    buffer.write(&chunk)?;
                    offset += len;
                }
                buffer.write_completed()?;
                Ok(offset)
            })
            .context("failed to spawn producer")?
    };

    let peer = raw.memory_channel();
    peer.feed(REQUEST);
    let mut received = 0usize;
    let mut released = 0usize;

    while released == 0 {
        if started.elapsed() > deadline {
            component_warn!("reactor", "Deadline of {:?} exceeded, shutting down", deadline);
            buffer.abort();
            registry.shutdown_all();
            registry.drain_closed();
            let _ = producer.join();
            anyhow::bail!("pump did not finish within {:?}", deadline);
        }

        // Peer consumes what was written and opens a fresh window
        received += check_payload(&peer.take_outbound(), received)?;
        peer.set_write_window(Some(config.sink_window));

        let ready = session.event_mask();
        if !ready.is_empty() {
            if let Err(e) = registry.process_events(&session, ready) {
                // The session is already shut down, release the producer too
                buffer.abort();
                registry.drain_closed();
                let _ = producer.join();
                return Err(e).context("dispatch failed");
            }
        }
        registry.check_timeouts(SystemTime::now());
        released = registry.drain_closed();
        thread::sleep(config.session.select_interval);
    }

    received += check_payload(&peer.take_outbound(), received)?;
    let sent = producer
        .join()
        .map_err(|_| anyhow::anyhow!("producer thread panicked"))?
        .context("producer failed")?;

    Ok(PumpReport {
        bytes_sent: sent,
        bytes_received: received,
        request_bytes: handler.request_bytes.load(Ordering::Relaxed),
        output_cycles: handler.output_cycles.load(Ordering::Relaxed),
        released_sessions: released,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PumpConfig {
        let mut config = PumpConfig {
            payload_bytes: 20_000,
            chunk_size: 700,
            sink_window: 1024,
            ..PumpConfig::default()
        };
        config.session.buffer_size = 2048;
        config.session.select_interval = Duration::ZERO;
        config
    }

    #[test]
    fn test_pump_delivers_whole_payload() {
        let report = run(&small_config(), Duration::from_secs(30)).unwrap();
        assert_eq!(report.bytes_sent, 20_000);
        assert_eq!(report.bytes_received, 20_000);
        assert_eq!(report.request_bytes, REQUEST.len());
        assert_eq!(report.released_sessions, 1);
        // Window of 1 KiB per cycle needs many output cycles
        assert!(report.output_cycles >= 20);
    }

    #[test]
    fn test_pump_with_large_chunks() {
        let mut config = small_config();
        config.chunk_size = 5000;
        config.sink_window = 3000;
        let report = run(&config, Duration::from_secs(30)).unwrap();
        assert_eq!(report.bytes_received, 20_000);
    }

    #[test]
    fn test_empty_payload_still_closes() {
        let mut config = small_config();
        config.payload_bytes = 0;
        let report = run(&config, Duration::from_secs(30)).unwrap();
        assert_eq!(report.bytes_received, 0);
        assert_eq!(report.released_sessions, 1);
    }
}
