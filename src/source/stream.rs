//! Live vitals over a push transport.
//!
//! A transport delivers raw JSON frames for one patient; the source decodes
//! them into [`VitalsSample`]s and exposes only the most recent one.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{SampleStream, VitalsSource};
use crate::backend::SharedAddress;
use crate::data::VitalsSample;
use crate::error::SourceError;

/// Raw payload frames for one patient. The channel closes on disconnect.
pub type Frames = mpsc::Receiver<Vec<u8>>;

/// A push-capable channel keyed by patient ID.
///
/// Order is reliable within one connection and unreliable across reconnects.
#[async_trait]
pub trait VitalsTransport: Send + Sync + std::fmt::Debug {
    async fn open(&self, patient_id: &str) -> Result<Frames, SourceError>;

    fn description(&self) -> &str;
}

/// Longest accepted frame in bytes; longer lines are discarded whole.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Spawn a background task that splits an async reader into newline-delimited frames.
///
/// Frames are passed on as raw bytes. Lines over [`MAX_FRAME_LEN`] are
/// skipped up to the next newline without being buffered.
pub fn frames_from_reader<R>(reader: R, description: &str) -> Frames
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    let desc = description.to_string();

    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = (&mut reader)
                .take(MAX_FRAME_LEN as u64 + 1)
                .read_until(b'\n', &mut line)
                .await;

            match read {
                Ok(0) => {
                    debug!("{}: connection closed", desc);
                    break;
                }
                Ok(_) if line.len() > MAX_FRAME_LEN && line.last() != Some(&b'\n') => {
                    warn!("{}: dropping frame over {} bytes", desc, MAX_FRAME_LEN);
                    match skip_line(&mut reader).await {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            warn!("{}: read error: {}", desc, e);
                            break;
                        }
                    }
                }
                Ok(_) => {
                    let frame = trim_frame(&line);
                    if frame.is_empty() {
                        continue;
                    }
                    if tx.send(frame.to_vec()).await.is_err() {
                        // Receiver dropped
                        break;
                    }
                }
                Err(e) => {
                    warn!("{}: read error: {}", desc, e);
                    break;
                }
            }
        }
    });

    rx
}

/// Discard input through the next newline. Returns `false` at end of input.
async fn skip_line<R>(reader: &mut R) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (found, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(false);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => (true, i + 1),
                None => (false, available.len()),
            }
        };
        reader.consume(used);
        if found {
            return Ok(true);
        }
    }
}

fn trim_frame(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Vitals over TCP: one connection per patient, newline-delimited JSON.
///
/// After connecting, the transport sends `{"subscribe":"<patient id>"}`
/// and then reads one sample per line. The address is read on every
/// `open`, so a committed address change applies to the next reconnect.
#[derive(Debug, Clone)]
pub struct TcpVitalsTransport {
    address: SharedAddress,
    connect_timeout: Duration,
}

impl TcpVitalsTransport {
    pub fn new(address: SharedAddress, connect_timeout: Duration) -> Self {
        Self {
            address,
            connect_timeout,
        }
    }
}

#[async_trait]
impl VitalsTransport for TcpVitalsTransport {
    async fn open(&self, patient_id: &str) -> Result<Frames, SourceError> {
        let addr = self.address.get().to_string();
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SourceError::Timeout)??;

        let mut request = serde_json::json!({ "subscribe": patient_id }).to_string();
        request.push('\n');
        stream.write_all(request.as_bytes()).await?;

        Ok(frames_from_reader(stream, &format!("tcp://{}/{}", addr, patient_id)))
    }

    fn description(&self) -> &str {
        "tcp"
    }
}

/// In-process transport fed through byte channels.
///
/// Each call to [`ChannelTransport::connection`] queues one connection for a
/// patient; the next `open` for that patient takes it. Dropping the returned
/// sender ends that connection. Useful for bridging another push client
/// (a database listener, a message bus) into the feed.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    pending: Mutex<HashMap<String, VecDeque<Frames>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a connection for a patient and return its sending half.
    pub fn connection(&self, patient_id: &str) -> mpsc::Sender<Vec<u8>> {
        let (tx, rx) = mpsc::channel(16);
        self.pending
            .lock()
            .entry(patient_id.to_string())
            .or_default()
            .push_back(rx);
        tx
    }
}

#[async_trait]
impl VitalsTransport for ChannelTransport {
    async fn open(&self, patient_id: &str) -> Result<Frames, SourceError> {
        self.pending
            .lock()
            .get_mut(patient_id)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| SourceError::Connection(format!("no connection for {}", patient_id)))
    }

    fn description(&self) -> &str {
        "channel"
    }
}

/// Live vitals source decoding JSON frames from a [`VitalsTransport`].
#[derive(Debug)]
pub struct LiveVitalsSource<T> {
    transport: T,
    description: String,
}

impl<T: VitalsTransport> LiveVitalsSource<T> {
    pub fn new(transport: T) -> Self {
        let description = format!("live vitals: {}", transport.description());
        Self {
            transport,
            description,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[async_trait]
impl<T: VitalsTransport> VitalsSource for LiveVitalsSource<T> {
    async fn connect(&self, patient_id: &str) -> Result<SampleStream, SourceError> {
        let mut frames = self.transport.open(patient_id).await?;
        let (tx, rx) = watch::channel(None);
        let patient = patient_id.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = frames.recv() => {
                        let Some(bytes) = frame else {
                            debug!("Vitals transport for {} disconnected", patient);
                            break;
                        };
                        match serde_json::from_slice::<VitalsSample>(&bytes) {
                            Ok(sample) => {
                                if tx.send(Some(sample)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Skipping malformed vitals payload for {}: {}", patient, e);
                            }
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(rx)
    }

    fn description(&self) -> &str {
        &self.description
    }
}
