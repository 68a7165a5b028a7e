//! The decoder seen from the feeder: something that takes NAL units and,
//! whenever it likes and from whatever thread, reports frames or failures.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::error::SinkError;
use crate::nalu::NalUnit;
use crate::sps::{SpsGeometry, parse_sps_geometry};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    Frame { width: u32, height: u32 },
    Failed(String),
}

/// Handed to the sink on open. Cheap to clone into a decoder output thread.
#[derive(Clone)]
pub struct SinkEvents {
    tx: Sender<SinkEvent>,
}

impl SinkEvents {
    pub fn frame(&self, width: u32, height: u32) {
        let _ = self.tx.send(SinkEvent::Frame { width, height });
    }

    pub fn failed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(SinkEvent::Failed(reason.into()));
    }
}

pub(crate) fn event_channel() -> (SinkEvents, Receiver<SinkEvent>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (SinkEvents { tx }, rx)
}

pub trait DecoderSink: Send {
    /// Acquires the decoder. An error here fails the session start.
    fn open(&mut self, events: SinkEvents) -> Result<(), SinkError>;

    /// Blocks up to `timeout` for the decoder to accept input.
    fn wait_input_ready(&mut self, timeout: Duration) -> bool {
        let _ = timeout;
        true
    }

    fn submit(&mut self, unit: &NalUnit) -> Result<(), SinkError>;

    /// Releases the decoder. Called once, from the feeder thread.
    fn close(&mut self) {}

    fn name(&self) -> &'static str {
        "decoder"
    }
}

/// Decodes nothing. Reads picture size from SPS units and reports one frame
/// per picture, which is enough to drive ratio and FPS reporting without a
/// real decoder.
#[derive(Default)]
pub struct ProbeSink {
    events: Option<SinkEvents>,
    geometry: Option<SpsGeometry>,
}

impl ProbeSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DecoderSink for ProbeSink {
    fn open(&mut self, events: SinkEvents) -> Result<(), SinkError> {
        self.events = Some(events);
        Ok(())
    }

    fn submit(&mut self, unit: &NalUnit) -> Result<(), SinkError> {
        let events = self.events.as_ref().ok_or(SinkError::Closed)?;
        if unit.is_sps() {
            match parse_sps_geometry(unit.payload()) {
                Some(geometry) => self.geometry = Some(geometry),
                None => events.failed(format!("unreadable sps in unit {}", unit.seq())),
            }
        } else if unit.starts_picture() {
            if let Some(geometry) = self.geometry {
                events.frame(geometry.width, geometry.height);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.events = None;
    }

    fn name(&self) -> &'static str {
        "probe"
    }
}

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegSink;

#[cfg(feature = "ffmpeg")]
mod ffmpeg {
    use super::{DecoderSink, SinkEvents};
    use crate::error::SinkError;
    use crate::nalu::NalUnit;

    /// Software H.264 decoding through libavcodec.
    #[derive(Default)]
    pub struct FfmpegSink {
        decoder: Option<ffmpeg_next::codec::decoder::Video>,
        events: Option<SinkEvents>,
    }

    impl FfmpegSink {
        pub fn new() -> Self {
            Self::default()
        }

        fn receive_frames(&mut self) {
            let (Some(decoder), Some(events)) = (self.decoder.as_mut(), self.events.as_ref())
            else {
                return;
            };
            loop {
                let mut frame = ffmpeg_next::frame::Video::empty();
                match decoder.receive_frame(&mut frame) {
                    Ok(()) => events.frame(frame.width(), frame.height()),
                    Err(ffmpeg_next::Error::Eof) => break,
                    Err(ffmpeg_next::Error::Other { errno })
                        if errno == ffmpeg_next::util::error::EAGAIN =>
                    {
                        break;
                    }
                    Err(err) => {
                        events.failed(format!("receive frame: {}", err));
                        break;
                    }
                }
            }
        }
    }

    impl DecoderSink for FfmpegSink {
        fn open(&mut self, events: SinkEvents) -> Result<(), SinkError> {
            crate::init()?;
            let codec = ffmpeg_next::codec::decoder::find(ffmpeg_next::codec::Id::H264)
                .ok_or_else(|| SinkError::Unavailable("h264 decoder not found".to_string()))?;
            let decoder = ffmpeg_next::codec::Context::new_with_codec(codec)
                .decoder()
                .video()
                .map_err(|e| SinkError::Unavailable(e.to_string()))?;
            self.decoder = Some(decoder);
            self.events = Some(events);
            Ok(())
        }

        fn submit(&mut self, unit: &NalUnit) -> Result<(), SinkError> {
            let decoder = self.decoder.as_mut().ok_or(SinkError::Closed)?;
            let packet = ffmpeg_next::Packet::copy(unit.data());
            decoder
                .send_packet(&packet)
                .map_err(|e| SinkError::Rejected {
                    seq: unit.seq(),
                    reason: e.to_string(),
                })?;
            self.receive_frames();
            Ok(())
        }

        fn close(&mut self) {
            if let Some(decoder) = self.decoder.as_mut() {
                if let Err(e) = decoder.send_eof() {
                    log::error!("decoder send eof error: {}", e);
                }
            }
            self.receive_frames();
            self.decoder = None;
            self.events = None;
        }

        fn name(&self) -> &'static str {
            "ffmpeg"
        }
    }
}
