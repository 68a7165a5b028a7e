use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use nalu_bus::{DecoderSink, ProbeSink, SessionConfig, SourceConfig};

/// Default video port of the air unit.
pub const DEFAULT_UDP_PORT: u16 = 5600;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    /// Parse SPS for geometry, count pictures, decode nothing
    Probe,
    #[cfg(feature = "ffmpeg")]
    /// Software decoding through FFmpeg
    Ffmpeg,
}

/// Low-latency H.264 receive and decode pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// UDP port to listen on (the default source)
    #[arg(short, long, conflicts_with_all = ["file", "asset"])]
    pub udp: Option<u16>,

    /// UDP payload is RTP rather than a raw Annex-B stream
    #[arg(long)]
    pub rtp: bool,

    /// Play a raw .h264 file
    #[arg(short, long, conflicts_with = "asset")]
    pub file: Option<PathBuf>,

    /// Play a file from the assets directory
    #[arg(short, long)]
    pub asset: Option<String>,

    /// Play anything FFmpeg can open (rtsp, mp4, ...)
    #[cfg(feature = "ffmpeg")]
    #[arg(long, conflicts_with_all = ["udp", "file", "asset"])]
    pub url: Option<String>,

    /// JSON session config; flags below override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Limit file playback to this many frames per second
    #[arg(long)]
    pub max_fps: Option<u32>,

    /// Write a raw copy of live streams into this directory
    #[arg(long)]
    pub record_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = SinkKind::Probe)]
    pub sink: SinkKind,

    /// Status API address
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,
}

impl Args {
    pub fn source(&self) -> SourceConfig {
        #[cfg(feature = "ffmpeg")]
        if let Some(url) = &self.url {
            return SourceConfig::Url { url: url.clone() };
        }
        if let Some(path) = &self.file {
            return SourceConfig::File { path: path.clone() };
        }
        if let Some(name) = &self.asset {
            return SourceConfig::Asset { name: name.clone() };
        }
        SourceConfig::Udp {
            port: self.udp.unwrap_or(DEFAULT_UDP_PORT),
            rtp: self.rtp,
        }
    }

    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)?,
            None => SessionConfig::default(),
        };
        if self.max_fps.is_some() {
            config.max_fps = self.max_fps;
        }
        if let Some(dir) = &self.record_dir {
            config.record_dir = Some(dir.clone());
        }
        Ok(config)
    }

    pub fn sink(&self) -> Box<dyn DecoderSink> {
        match self.sink {
            SinkKind::Probe => Box::new(ProbeSink::new()),
            #[cfg(feature = "ffmpeg")]
            SinkKind::Ffmpeg => Box::new(nalu_bus::FfmpegSink::new()),
        }
    }
}
