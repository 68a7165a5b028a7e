use std::fs::File;
use std::io::{ErrorKind, Read};
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::SourceError;
use crate::framer::FramingMode;
use crate::ingest::Ingest;

/// How often a blocked UDP read wakes up to look at the cancel token.
const UDP_READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Longest single sleep while pacing a file.
const PACING_SLICE: Duration = Duration::from_millis(20);
/// Largest possible UDP datagram.
const MAX_DATAGRAM: usize = 65536;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Udp {
        port: u16,
        #[serde(default)]
        rtp: bool,
    },
    File {
        path: PathBuf,
    },
    /// A file bundled with the application, looked up under `assets_dir`.
    Asset {
        name: String,
    },
    /// Bytes arrive only through `Session::push_bytes`.
    External,
    /// Anything FFmpeg can open (rtsp, mp4, mkv, ...). Only the H.264 video
    /// stream is read.
    #[cfg(feature = "ffmpeg")]
    Url {
        url: String,
    },
}

impl SourceConfig {
    pub fn framing(&self) -> FramingMode {
        match self {
            SourceConfig::Udp { rtp: true, .. } => FramingMode::Rtp,
            _ => FramingMode::AnnexB,
        }
    }

    /// Live sources are the ones worth a ground recording.
    pub fn is_live(&self) -> bool {
        matches!(self, SourceConfig::Udp { .. } | SourceConfig::External)
    }

    pub fn describe(&self) -> String {
        match self {
            SourceConfig::Udp { port, rtp: false } => format!("raw h264 on udp port {}", port),
            SourceConfig::Udp { port, rtp: true } => format!("rtp h264 on udp port {}", port),
            SourceConfig::File { path } => format!("file {}", path.display()),
            SourceConfig::Asset { name } => format!("asset {}", name),
            SourceConfig::External => "external data".to_string(),
            #[cfg(feature = "ffmpeg")]
            SourceConfig::Url { url } => format!("url {}", url),
        }
    }
}

/// A running reader thread.
pub struct SourceTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SourceTask {
    /// Opens the source on the calling thread, so that a missing file or a
    /// busy port fails the session start, then reads on a new thread.
    /// `External` has nothing to read and yields `None`.
    pub fn spawn(
        source: &SourceConfig,
        config: &SessionConfig,
        ingest: Arc<Ingest>,
        cancel: CancellationToken,
    ) -> Result<Option<Self>, SourceError> {
        let reader = match source {
            SourceConfig::External => return Ok(None),
            SourceConfig::File { path } => Reader::File {
                file: File::open(path)?,
                chunk_size: config.chunk_size,
                pacer: config.max_fps.map(Pacer::new),
            },
            SourceConfig::Asset { name } => {
                let path = config.assets_dir.join(name);
                if !path.is_file() {
                    return Err(SourceError::AssetNotFound(path.display().to_string()));
                }
                Reader::File {
                    file: File::open(&path)?,
                    chunk_size: config.chunk_size,
                    pacer: config.max_fps.map(Pacer::new),
                }
            }
            #[cfg(feature = "ffmpeg")]
            SourceConfig::Url { url } => {
                Reader::Url(url::UrlReader::open(url, config.max_fps.map(Pacer::new))?)
            }
            SourceConfig::Udp { port, .. } => {
                let socket = UdpSocket::bind(("0.0.0.0", *port))?;
                socket.set_read_timeout(Some(UDP_READ_TIMEOUT))?;
                Reader::Udp {
                    socket,
                    buffer_size: config.udp_buffer_size.clamp(1, MAX_DATAGRAM),
                }
            }
        };

        let description = source.describe();
        let cancel_inner = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("nalu-source".to_string())
            .spawn(move || {
                log::info!("reading {}", description);
                match reader.run(&ingest, &cancel_inner) {
                    Ok(()) => log::info!("source {} finished", description),
                    Err(e) => log::error!("source {} error: {:#?}", description, e),
                }
            })?;

        Ok(Some(Self {
            cancel,
            handle: Some(handle),
        }))
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("source thread panicked");
            }
        }
    }
}

impl Drop for SourceTask {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Reader {
    File {
        file: File,
        chunk_size: usize,
        pacer: Option<Pacer>,
    },
    Udp {
        socket: UdpSocket,
        buffer_size: usize,
    },
    #[cfg(feature = "ffmpeg")]
    Url(url::UrlReader),
}

impl Reader {
    fn run(self, ingest: &Ingest, cancel: &CancellationToken) -> std::io::Result<()> {
        match self {
            Reader::File {
                mut file,
                chunk_size,
                mut pacer,
            } => {
                let mut buf = vec![0u8; chunk_size];
                loop {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    let n = match file.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    };
                    let ingested = ingest.push_bytes(&buf[..n]);
                    if let Some(pacer) = pacer.as_mut() {
                        pacer.pace(ingested.pictures, cancel);
                    }
                }
                // the stream ends here but the session keeps running idle
                ingest.finish();
                Ok(())
            }
            Reader::Udp {
                socket,
                buffer_size,
            } => {
                let mut buf = vec![0u8; buffer_size];
                loop {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    match socket.recv(&mut buf) {
                        Ok(n) => {
                            ingest.push_bytes(&buf[..n]);
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                            ) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            #[cfg(feature = "ffmpeg")]
            Reader::Url(reader) => reader.run(ingest, cancel),
        }
    }
}

/// Holds file playback to at most `fps` pictures per second.
struct Pacer {
    period: Duration,
    next: Option<Instant>,
}

impl Pacer {
    fn new(fps: u32) -> Self {
        Self {
            period: Duration::from_secs(1) / fps.max(1),
            next: None,
        }
    }

    fn pace(&mut self, pictures: usize, cancel: &CancellationToken) {
        for _ in 0..pictures {
            let now = Instant::now();
            let due = self.next.unwrap_or(now);
            while !cancel.is_cancelled() {
                let now = Instant::now();
                if now >= due {
                    break;
                }
                std::thread::sleep((due - now).min(PACING_SLICE));
            }
            // fall back to real time instead of bursting after a stall
            self.next = Some(due.max(now) + self.period);
        }
    }
}

#[cfg(feature = "ffmpeg")]
mod url {
    use std::path::Path;

    use ffmpeg_next::{Dictionary, codec, media};
    use tokio_util::sync::CancellationToken;

    use super::Pacer;
    use crate::avcc::AvccConfig;
    use crate::error::SourceError;
    use crate::ingest::Ingest;

    /// Network reads give up after this long, so a dead stream cannot hold
    /// the reader thread (and with it `Session::stop`) forever.
    const READ_TIMEOUT_US: &str = "2000000";

    pub(super) struct UrlReader {
        input: ffmpeg_next::format::context::Input,
        stream_index: usize,
        avcc: Option<AvccConfig>,
        pacer: Option<Pacer>,
    }

    impl UrlReader {
        pub(super) fn open(url: &str, pacer: Option<Pacer>) -> Result<Self, SourceError> {
            let open_error = |reason: String| SourceError::Open {
                url: url.to_string(),
                reason,
            };
            crate::init().map_err(|e| open_error(e.to_string()))?;

            let mut options = Dictionary::new();
            options.set("rw_timeout", READ_TIMEOUT_US);
            let input = ffmpeg_next::format::input_with_dictionary(Path::new(url), options)
                .map_err(|e| open_error(e.to_string()))?;

            let (stream_index, avcc) = {
                let stream = input
                    .streams()
                    .best(media::Type::Video)
                    .ok_or_else(|| SourceError::NoVideoStream(url.to_string()))?;
                let parameters = stream.parameters();
                if parameters.id() != codec::Id::H264 {
                    return Err(SourceError::NoVideoStream(url.to_string()));
                }
                let avcc = extradata(&parameters).and_then(|data| AvccConfig::parse(&data));
                (stream.index(), avcc)
            };
            log::info!(
                "{} opened, video stream {}, {}",
                url,
                stream_index,
                if avcc.is_some() { "avcc" } else { "annex-b" }
            );

            Ok(Self {
                input,
                stream_index,
                avcc,
                pacer,
            })
        }

        pub(super) fn run(self, ingest: &Ingest, cancel: &CancellationToken) -> std::io::Result<()> {
            let Self {
                mut input,
                stream_index,
                avcc,
                mut pacer,
            } = self;

            if let Some(avcc) = &avcc {
                ingest.push_bytes(avcc.parameter_sets());
            }
            for (stream, packet) in input.packets() {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                if stream.index() != stream_index {
                    continue;
                }
                let Some(data) = packet.data() else {
                    continue;
                };
                let ingested = match &avcc {
                    Some(avcc) => {
                        // parameter sets live in the container, repeat them
                        // so a decoder can join at any keyframe
                        if packet.is_key() {
                            ingest.push_bytes(avcc.parameter_sets());
                        }
                        ingest.push_bytes(&avcc.to_annexb(data))
                    }
                    None => ingest.push_bytes(data),
                };
                if let Some(pacer) = pacer.as_mut() {
                    pacer.pace(ingested.pictures, cancel);
                }
            }
            ingest.finish();
            Ok(())
        }
    }

    /// Copies the codec extradata out of the raw `AVCodecParameters`.
    fn extradata(parameters: &codec::Parameters) -> Option<Vec<u8>> {
        unsafe {
            let p = parameters.as_ptr();
            let data = (*p).extradata;
            let size = (*p).extradata_size;
            if data.is_null() || size <= 0 {
                return None;
            }
            Some(std::slice::from_raw_parts(data, size as usize).to_vec())
        }
    }
}

#[cfg(test)]
#[path = "source_test.rs"]
mod source_test;
