//! File-backed media: pace IVF/Ogg files into local tracks and persist
//! remote tracks to disk.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;

use fullmesh_common::{Error, Result};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use webrtc::media::io::ivf_reader::{IVFFileHeader, IVFReader};
use webrtc::media::io::ivf_writer::IVFWriter;
use webrtc::media::io::ogg_reader::{OggPageHeader, OggReader};
use webrtc::media::io::ogg_writer::OggWriter;
use webrtc::media::io::Writer;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::MediaConfig;
use crate::engine::IceState;

pub const OPUS_SAMPLE_RATE: u32 = 48_000;
pub const OPUS_CHANNELS: u8 = 2;
const RTCP_BUFFER_SIZE: usize = 1500;

/// Shared handle to a container writer.
pub type SharedWriter = Arc<Mutex<dyn Writer + Send + Sync>>;

/// Input files found on disk.
#[derive(Debug, Clone, Default)]
pub struct MediaSources {
    pub video: Option<PathBuf>,
    pub audio: Option<PathBuf>,
}

impl MediaSources {
    pub fn discover(config: &MediaConfig) -> Result<Self> {
        let video = config
            .video_input
            .exists()
            .then(|| config.video_input.clone());
        let audio = config
            .audio_input
            .exists()
            .then(|| config.audio_input.clone());

        if config.require_input && video.is_none() && audio.is_none() {
            return Err(Error::config(format!(
                "could not find `{}` or `{}`",
                config.audio_input.display(),
                config.video_input.display()
            )));
        }

        Ok(Self { video, audio })
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

/// Time between IVF frames for the file's declared timebase.
pub fn video_frame_interval(timebase_numerator: u32, timebase_denominator: u32) -> Result<Duration> {
    if timebase_denominator == 0 {
        return Err(Error::encoding("IVF timebase denominator is zero"));
    }
    let millis = 1000 * u64::from(timebase_numerator) / u64::from(timebase_denominator);
    Ok(Duration::from_millis(millis))
}

/// Playback duration of an Ogg page: the granule delta at 48 kHz.
pub fn audio_page_duration(granule_position: u64, last_granule: u64) -> Duration {
    let samples = granule_position.saturating_sub(last_granule);
    Duration::from_millis(samples * 1000 / u64::from(OPUS_SAMPLE_RATE))
}

/// `output{index}.ogg` and `output{index}.ivf` under `dir`.
pub fn output_paths(dir: &Path, index: usize) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("output{index}.ogg")),
        dir.join(format!("output{index}.ivf")),
    )
}

async fn wait_connected(ice: &mut watch::Receiver<IceState>) -> Result<()> {
    ice.wait_for(|s| matches!(s, IceState::Connected | IceState::Completed))
        .await
        .map(|_| ())
        .map_err(|_| Error::negotiation("peer dropped before ICE connected"))
}

/// How far a container reader got into its input.
///
/// The container readers report end of input and corruption with the same
/// error type, so the byte count and EOF flag tell them apart.
#[derive(Debug, Default)]
pub struct ReadProgress {
    bytes: AtomicU64,
    eof: AtomicBool,
}

impl ReadProgress {
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// True when input ended before a single byte of the next unit was read.
    pub fn ended_cleanly_since(&self, before: u64) -> bool {
        self.eof.load(Ordering::Relaxed) && self.bytes() == before
    }
}

/// Reader wrapper feeding a [`ReadProgress`].
pub struct TrackedReader<R> {
    inner: R,
    progress: Arc<ReadProgress>,
}

impl<R> TrackedReader<R> {
    pub fn new(inner: R) -> (Self, Arc<ReadProgress>) {
        let progress = Arc::new(ReadProgress::default());
        (
            Self {
                inner,
                progress: Arc::clone(&progress),
            },
            progress,
        )
    }
}

impl<R: Read> Read for TrackedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.progress.eof.store(true, Ordering::Relaxed);
        }
        self.progress.bytes.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Next IVF frame, `None` at a clean end of file.
pub fn next_ivf_frame<R: Read>(
    ivf: &mut IVFReader<R>,
    progress: &ReadProgress,
) -> Result<Option<BytesMut>> {
    let before = progress.bytes();
    match ivf.parse_next_frame() {
        Ok((frame, _)) => Ok(Some(frame)),
        Err(_) if progress.ended_cleanly_since(before) => Ok(None),
        Err(err) => Err(Error::encoding(format!("corrupt IVF frame: {err}"))),
    }
}

/// Next Ogg page, `None` at a clean end of file.
pub fn next_ogg_page<R: Read>(
    ogg: &mut OggReader<R>,
    progress: &ReadProgress,
) -> Result<Option<(BytesMut, OggPageHeader)>> {
    let before = progress.bytes();
    match ogg.parse_next_page() {
        Ok(page) => Ok(Some(page)),
        Err(_) if progress.ended_cleanly_since(before) => Ok(None),
        Err(err) => Err(Error::encoding(format!("corrupt Ogg page: {err}"))),
    }
}

/// Pace an IVF file into `track`, one frame per timebase tick, once ICE
/// has connected.
pub async fn forward_video(
    track: Arc<TrackLocalStaticSample>,
    path: PathBuf,
    mut ice: watch::Receiver<IceState>,
) -> Result<()> {
    let (reader, progress) = TrackedReader::new(BufReader::new(File::open(&path)?));
    let (mut ivf, header) = IVFReader::new(reader).map_err(Error::encoding)?;
    let interval = video_frame_interval(header.timebase_numerator, header.timebase_denominator)?;

    wait_connected(&mut ice).await?;

    while let Some(frame) = next_ivf_frame(&mut ivf, &progress)? {
        tokio::time::sleep(interval).await;
        track
            .write_sample(&Sample {
                data: frame.freeze(),
                duration: Duration::from_secs(1),
                ..Default::default()
            })
            .await
            .map_err(Error::encoding)?;
    }

    info!("All video frames parsed and sent");
    Ok(())
}

/// Pace an Ogg/Opus file into `track`, sleeping each page's duration.
pub async fn forward_audio(
    track: Arc<TrackLocalStaticSample>,
    path: PathBuf,
    mut ice: watch::Receiver<IceState>,
) -> Result<()> {
    let (reader, progress) = TrackedReader::new(BufReader::new(File::open(&path)?));
    // Checksums are not verified.
    let (mut ogg, _) = OggReader::new(reader, false).map_err(Error::encoding)?;

    wait_connected(&mut ice).await?;

    let mut last_granule = 0u64;
    while let Some((page_data, page_header)) = next_ogg_page(&mut ogg, &progress)? {
        let duration = audio_page_duration(page_header.granule_position, last_granule);
        last_granule = page_header.granule_position;

        track
            .write_sample(&Sample {
                data: page_data.freeze(),
                duration,
                ..Default::default()
            })
            .await
            .map_err(Error::encoding)?;

        tokio::time::sleep(duration).await;
    }

    info!("All audio pages parsed and sent");
    Ok(())
}

/// Read RTCP for a sender so interceptors (NACK and friends) keep running.
pub async fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    let mut buf = vec![0u8; RTCP_BUFFER_SIZE];
    while sender.read(&mut buf).await.is_ok() {}
}

/// Ask the publisher of `media_ssrc` for a keyframe every `interval` for as
/// long as the peer connection lives.
pub async fn send_pli(pc: Weak<RTCPeerConnection>, media_ssrc: u32, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let Some(pc) = pc.upgrade() else {
            return;
        };
        if let Err(err) = pc
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })])
            .await
        {
            debug!("PLI for ssrc {} not sent: {}", media_ssrc, err);
        }
    }
}

/// Output containers for one peer.
#[derive(Clone)]
pub struct OutputWriters {
    pub audio: SharedWriter,
    pub video: SharedWriter,
    paths: (PathBuf, PathBuf),
    closed: Arc<AtomicBool>,
}

impl OutputWriters {
    pub fn create(dir: &Path, index: usize) -> Result<Self> {
        let (ogg_path, ivf_path) = output_paths(dir, index);

        let ogg = OggWriter::new(File::create(&ogg_path)?, OPUS_SAMPLE_RATE, OPUS_CHANNELS)
            .map_err(Error::encoding)?;
        let ivf = IVFWriter::new(
            File::create(&ivf_path)?,
            &IVFFileHeader {
                signature: *b"DKIF",
                version: 0,
                header_size: 32,
                four_cc: *b"VP80",
                width: 640,
                height: 480,
                timebase_denominator: 30,
                timebase_numerator: 1,
                num_frames: 900,
                unused: 0,
            },
        )
        .map_err(Error::encoding)?;

        Ok(Self {
            audio: Arc::new(Mutex::new(ogg)),
            video: Arc::new(Mutex::new(ivf)),
            paths: (ogg_path, ivf_path),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn audio_path(&self) -> &Path {
        &self.paths.0
    }

    pub fn video_path(&self) -> &Path {
        &self.paths.1
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Finalize both containers. Only the first call writes anything.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.audio.lock().await.close().map_err(Error::encoding)?;
        self.video.lock().await.close().map_err(Error::encoding)?;
        Ok(())
    }
}

/// Copy RTP from `track` into `writer` until the track ends or ICE fails.
pub async fn save_track(
    writer: SharedWriter,
    track: Arc<TrackRemote>,
    mut ice: watch::Receiver<IceState>,
) -> Result<()> {
    loop {
        tokio::select! {
            result = track.read_rtp() => {
                let Ok((packet, _)) = result else {
                    return Ok(());
                };
                writer
                    .lock()
                    .await
                    .write_rtp(&packet)
                    .map_err(Error::encoding)?;
            }
            _ = async { ice.wait_for(|s| s.is_failure()).await.map(|_| ()) } => {
                return Ok(());
            }
        }
    }
}

/// Log the size of every packet on a track nobody stores.
pub async fn log_track(track: Arc<TrackRemote>) {
    let ssrc = track.ssrc();
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => debug!(
                "track {} packet seq={} {} bytes",
                ssrc,
                packet.header.sequence_number,
                packet.payload.len()
            ),
            Err(err) => {
                debug!("track {} ended: {}", ssrc, err);
                return;
            }
        }
    }
}

pub(crate) fn log_forward_result(kind: &str, result: Result<()>) {
    if let Err(err) = result {
        warn!("{} forwarding stopped: {}", kind, err);
    }
}
