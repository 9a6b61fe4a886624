use std::sync::{Arc, PoisonError, RwLock};

use cam_motion_common::config::Config;
use cam_motion_common::frame::{format_timestamp, Frame, MotionEvent};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::debounce::{Edge, MotionDebouncer};
use crate::demux::FrameDemuxer;
use crate::history::{FrameHistory, FramePair};
use crate::score::{FrameScorer, MotionScorer};
use crate::supervisor::{
    DecoderCommand, DecoderOutput, ProcessSupervisor, ReconnectPolicy, SupervisorError,
};

const FRAME_CHANNEL_DEPTH: usize = 16;
const MOTION_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running { source: String },
    /// The decoder finished on its own with exit status 0.
    Ended,
    /// The decoder could not be kept alive; no further attempts are made.
    Failed { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("no source URI given")]
    NoSource,
}

struct ActivePipeline {
    source: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One camera feed: decoder → demuxer → scorer → debouncer.
///
/// At most one source is active at a time; `start` on a running session stops
/// the old decoder before spawning the new one. Collaborators observe the feed
/// through channels that outlive individual starts: every demuxed frame goes
/// to [`StreamSession::frames`] and every debounced rising edge to
/// [`StreamSession::motion_events`], both in frame arrival order.
pub struct StreamSession {
    config: Config,
    scorer: Arc<dyn FrameScorer>,
    supervisor: ProcessSupervisor,
    history: Arc<RwLock<FrameHistory>>,
    frames: broadcast::Sender<Frame>,
    motion: broadcast::Sender<MotionEvent>,
    status: Arc<watch::Sender<SessionStatus>>,
    active: Option<ActivePipeline>,
}

impl StreamSession {
    pub fn new(config: Config) -> Self {
        let scorer = Arc::new(MotionScorer::from_config(&config.motion));
        Self::with_scorer(config, scorer)
    }

    pub fn with_scorer(config: Config, scorer: Arc<dyn FrameScorer>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_DEPTH);
        let (motion, _) = broadcast::channel(MOTION_CHANNEL_DEPTH);
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            supervisor: ProcessSupervisor::new(ReconnectPolicy::from_config(&config.reconnect)),
            config,
            scorer,
            history: Arc::new(RwLock::new(FrameHistory::pair())),
            frames,
            motion,
            status: Arc::new(status),
            active: None,
        }
    }

    /// Start decoding `source_uri`, replacing any active source.
    pub async fn start(&mut self, source_uri: &str) -> Result<(), SessionError> {
        let source_uri = source_uri.trim();
        if source_uri.is_empty() {
            return Err(SessionError::NoSource);
        }
        if let Some(previous) = self.source().map(str::to_owned) {
            info!(previous = %previous, "session already running, stopping it first");
            self.stop().await;
        }

        let command = DecoderCommand::from_config(&self.config.decoder, source_uri);
        let output = match self.supervisor.start(command).await {
            Ok(output) => output,
            Err(e) => {
                self.status.send_replace(SessionStatus::Failed {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        self.status.send_replace(SessionStatus::Running {
            source: source_uri.to_string(),
        });

        let cancel = CancellationToken::new();
        let pipeline = Pipeline {
            debouncer: MotionDebouncer::from_config(&self.config.motion),
            scorer: Arc::clone(&self.scorer),
            history: Arc::clone(&self.history),
            frames: self.frames.clone(),
            motion: self.motion.clone(),
            status: Arc::clone(&self.status),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(pipeline.run(
            FrameDemuxer::new(self.config.demux.max_frame_bytes),
            output,
        ));

        info!(
            scorer = self.scorer.name(),
            threshold = self.config.motion.score_threshold,
            cooldown_ms = self.config.motion.cooldown_ms,
            "session started"
        );
        self.active = Some(ActivePipeline {
            source: source_uri.to_string(),
            cancel,
            task,
        });
        Ok(())
    }

    /// Halt the decoder and forget all per-source state. Idempotent.
    pub async fn stop(&mut self) {
        let active = self.active.take();
        if let Some(active) = &active {
            active.cancel.cancel();
        }
        self.supervisor.stop().await;
        if let Some(active) = active {
            if let Err(e) = active.task.await {
                warn!(error = %e, "pipeline task ended abnormally");
            }
            info!(source = %active.source, "session stopped");
        }
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.status.send_replace(SessionStatus::Idle);
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.status.borrow(), SessionStatus::Running { .. })
    }

    pub fn source(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.source.as_str())
    }

    /// Most recently demuxed frame of the active source.
    pub fn current_frame(&self) -> Option<Frame> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current()
            .cloned()
    }

    pub fn previous_frame(&self) -> Option<Frame> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .previous()
            .cloned()
    }

    /// Every demuxed frame, whether or not it shows motion. Slow receivers
    /// skip frames rather than holding up the feed.
    pub fn frames(&self) -> broadcast::Receiver<Frame> {
        self.frames.subscribe()
    }

    pub fn motion_events(&self) -> broadcast::Receiver<MotionEvent> {
        self.motion.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }
}

/// Result of one scoring job, tagged with the frame it judged.
struct Scored {
    frame: Frame,
    score: u64,
}

/// Per-start processing state. Dropped on stop, which is what clears the
/// debouncer and abandons any scoring still in flight.
struct Pipeline {
    debouncer: MotionDebouncer,
    scorer: Arc<dyn FrameScorer>,
    history: Arc<RwLock<FrameHistory>>,
    frames: broadcast::Sender<Frame>,
    motion: broadcast::Sender<MotionEvent>,
    status: Arc<watch::Sender<SessionStatus>>,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn run(
        mut self,
        mut demuxer: FrameDemuxer,
        mut output: mpsc::Receiver<DecoderOutput>,
    ) {
        // At most one scoring job runs; frames arriving meanwhile only mark
        // the newest pair as due.
        let mut jobs: JoinSet<Scored> = JoinSet::new();
        let mut pending = false;
        let mut source_open = true;
        let mut failure = None;
        let mut frame_count: u64 = 0;

        while source_open || !jobs.is_empty() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    match joined {
                        Ok(scored) => self.apply(scored),
                        Err(e) => warn!(error = %e, "scoring task failed"),
                    }
                    if std::mem::take(&mut pending) {
                        if let Some(pair) = self.latest_pair() {
                            self.dispatch(&mut jobs, pair);
                        }
                    }
                }
                msg = output.recv(), if source_open => match msg {
                    Some(DecoderOutput::Chunk(chunk)) => {
                        for frame in demuxer.feed(&chunk) {
                            frame_count += 1;
                            if frame_count % 100 == 0 {
                                debug!(frame_count, "frames demuxed");
                            }
                            let Some(pair) = self.accept(frame) else { continue };
                            if jobs.is_empty() {
                                self.dispatch(&mut jobs, pair);
                            } else {
                                pending = true;
                            }
                        }
                    }
                    Some(DecoderOutput::Failed(e)) => {
                        error!(error = %e, "decoder connection failed");
                        failure = Some(e.to_string());
                    }
                    None => source_open = false,
                },
            }
        }

        let status = match failure {
            Some(reason) => SessionStatus::Failed { reason },
            None => {
                info!(frame_count, "decoder output ended");
                SessionStatus::Ended
            }
        };
        self.status.send_replace(status);
    }

    /// Rotate `frame` into the history, publish it, and return the pair to
    /// score once there is a previous frame.
    fn accept(&self, frame: Frame) -> Option<FramePair> {
        let (pair, displaced) = {
            let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
            let displaced = history.push(frame.clone());
            (history.latest_pair(), displaced)
        };
        if let Some(old) = displaced {
            trace!(seq = old.seq, "frame left history");
        }
        // No subscribers is fine.
        let _ = self.frames.send(frame);
        pair
    }

    fn latest_pair(&self) -> Option<FramePair> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest_pair()
    }

    fn dispatch(&self, jobs: &mut JoinSet<Scored>, pair: FramePair) {
        let scorer = Arc::clone(&self.scorer);
        jobs.spawn_blocking(move || {
            let score = scorer.score(&pair.previous, &pair.current);
            Scored {
                frame: pair.current,
                score,
            }
        });
    }

    /// Feed a finished score to the debouncer unless a newer frame has
    /// become current since the job was dispatched.
    fn apply(&mut self, scored: Scored) {
        let current_seq = self
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current()
            .map(|f| f.seq);
        if current_seq != Some(scored.frame.seq) {
            debug!(
                seq = scored.frame.seq,
                current_seq = ?current_seq,
                "discarding stale score"
            );
            return;
        }

        match self
            .debouncer
            .observe(scored.score, scored.frame.captured_at_ms)
        {
            Edge::Rising => {
                info!(
                    score = scored.score,
                    seq = scored.frame.seq,
                    at = %format_timestamp(scored.frame.captured_at_ms),
                    "motion detected"
                );
                let _ = self.motion.send(MotionEvent::new(scored.score, scored.frame));
            }
            Edge::Falling => debug!(score = scored.score, "motion ended"),
            Edge::Steady => trace!(score = scored.score, "no transition"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    struct FixedScorer(u64);

    impl FrameScorer for FixedScorer {
        fn score(&self, _previous: &Frame, _current: &Frame) -> u64 {
            self.0
        }
    }

    fn tiny_jpeg(tag: u8) -> Vec<u8> {
        vec![0xFF, 0xD8, 0x10, tag, 0xFF, 0xD9]
    }

    fn test_pipeline(threshold: u64) -> (Pipeline, broadcast::Receiver<MotionEvent>) {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_DEPTH);
        let (motion, motion_rx) = broadcast::channel(MOTION_CHANNEL_DEPTH);
        let (status, _) = watch::channel(SessionStatus::Idle);
        let pipeline = Pipeline {
            debouncer: MotionDebouncer::new(threshold, 3_000),
            scorer: Arc::new(FixedScorer(0)),
            history: Arc::new(RwLock::new(FrameHistory::pair())),
            frames,
            motion,
            status: Arc::new(status),
            cancel: CancellationToken::new(),
        };
        (pipeline, motion_rx)
    }

    #[test]
    fn stale_scores_are_discarded() {
        let (mut pipeline, mut motion_rx) = test_pipeline(5_000);
        let f0 = Frame::new(tiny_jpeg(0), 0, 1_000);
        let f1 = Frame::new(tiny_jpeg(1), 1, 1_100);
        let f2 = Frame::new(tiny_jpeg(2), 2, 1_200);
        assert!(pipeline.accept(f0).is_none());
        let pair = pipeline.accept(f1.clone()).unwrap();
        assert_eq!(pair.current.seq, 1);
        pipeline.accept(f2.clone());

        // Frame 1 was superseded by frame 2 before its score came back.
        pipeline.apply(Scored { frame: f1, score: 80_000 });
        assert!(motion_rx.try_recv().is_err());

        pipeline.apply(Scored { frame: f2, score: 80_000 });
        let event = motion_rx.try_recv().unwrap();
        assert_eq!(event.frame.seq, 2);
        assert_eq!(event.score, 80_000);
        assert_eq!(event.detected_at_ms, 1_200);
    }

    #[test]
    fn accept_publishes_every_frame() {
        let (pipeline, _motion_rx) = test_pipeline(5_000);
        let mut frames_rx = pipeline.frames.subscribe();
        for seq in 0..3 {
            pipeline.accept(Frame::new(tiny_jpeg(seq as u8), seq, 0));
        }
        let seqs: Vec<u64> = std::iter::from_fn(|| frames_rx.try_recv().ok())
            .map(|f| f.seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        // Frame 0 was displaced; the pair rotated atomically.
        let pair = pipeline.latest_pair().unwrap();
        assert_eq!((pair.previous.seq, pair.current.seq), (1, 2));
    }

    #[tokio::test]
    async fn empty_source_is_rejected() {
        let mut session = StreamSession::new(Config::default());
        assert!(matches!(session.start("  ").await, Err(SessionError::NoSource)));
        assert!(!session.is_running());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use image::{DynamicImage, GrayImage, ImageFormat, Luma};
        use std::io::Cursor;
        use std::path::PathBuf;
        use std::time::{SystemTime, UNIX_EPOCH};
        use tokio::time::timeout;

        struct SlowScorer;

        impl FrameScorer for SlowScorer {
            fn score(&self, _previous: &Frame, _current: &Frame) -> u64 {
                std::thread::sleep(Duration::from_millis(300));
                u64::MAX
            }
        }

        fn scratch_dir(tag: &str) -> PathBuf {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos();
            let dir = std::env::temp_dir().join(format!(
                "cam-motion-{tag}-{}-{nanos}",
                std::process::id()
            ));
            std::fs::create_dir_all(&dir).unwrap();
            dir
        }

        fn config_with_script(script: &str) -> Config {
            let mut config = Config::default();
            config.decoder.program = "sh".into();
            config.decoder.args = Some(vec!["-c".into(), script.into()]);
            config.reconnect.max_attempts = 2;
            config.reconnect.delay_ms = 5;
            config
        }

        fn encode(img: &GrayImage) -> Vec<u8> {
            let mut out = Cursor::new(Vec::new());
            DynamicImage::ImageLuma8(img.clone())
                .write_to(&mut out, ImageFormat::Jpeg)
                .unwrap();
            out.into_inner()
        }

        async fn wait_for_status(session: &StreamSession, want: impl Fn(&SessionStatus) -> bool) {
            let mut rx = session.status();
            timeout(WAIT, rx.wait_for(|s| want(s)))
                .await
                .expect("timed out waiting for status")
                .expect("status channel closed");
        }

        fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        }

        #[tokio::test]
        async fn frames_flow_in_order_and_motion_fires_once() {
            let dir = scratch_dir("burst");
            let mut stream = Vec::new();
            for tag in 0..8u8 {
                stream.extend(tiny_jpeg(tag));
            }
            let file = dir.join("stream.mjpeg");
            std::fs::write(&file, &stream).unwrap();

            let mut session = StreamSession::with_scorer(
                config_with_script("cat '{uri}'"),
                Arc::new(FixedScorer(80_000)),
            );
            let mut frames_rx = session.frames();
            let mut motion_rx = session.motion_events();

            session.start(file.to_str().unwrap()).await.unwrap();
            wait_for_status(&session, |s| *s == SessionStatus::Ended).await;

            let frames = drain(&mut frames_rx);
            let seqs: Vec<u64> = frames.iter().map(|f| f.seq).collect();
            assert_eq!(seqs, (0..8).collect::<Vec<u64>>());
            assert_eq!(frames[3].data(), tiny_jpeg(3).as_slice());

            let events = drain(&mut motion_rx);
            assert_eq!(events.len(), 1, "sustained motion fires once within the cooldown");

            assert_eq!(session.current_frame().map(|f| f.seq), Some(7));
            assert_eq!(session.previous_frame().map(|f| f.seq), Some(6));

            session.stop().await;
            assert!(session.current_frame().is_none());
            assert!(session.previous_frame().is_none());
            let _ = std::fs::remove_dir_all(&dir);
        }

        #[tokio::test]
        async fn scene_change_triggers_motion_event() {
            let dir = scratch_dir("scene");
            let still = GrayImage::from_pixel(160, 120, Luma([20]));
            let mut changed = still.clone();
            for y in 50..70 {
                for x in 70..90 {
                    changed.put_pixel(x, y, Luma([220]));
                }
            }
            let (a, b) = (encode(&still), encode(&changed));
            for (i, bytes) in [&a, &a, &b, &b, &a].into_iter().enumerate() {
                std::fs::write(dir.join(format!("{i}.jpg")), bytes).unwrap();
            }

            let script = "for f in '{uri}'/*.jpg; do cat \"$f\"; sleep 0.2; done";
            let mut session = StreamSession::new(config_with_script(script));
            let mut motion_rx = session.motion_events();

            session.start(dir.to_str().unwrap()).await.unwrap();
            wait_for_status(&session, |s| *s == SessionStatus::Ended).await;

            // a→b fires; b→a comes back inside the cooldown.
            let events = drain(&mut motion_rx);
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].frame.seq, 2);
            assert_eq!(events[0].frame.data(), b.as_slice());
            assert!(events[0].score > 5_000);

            session.stop().await;
            let _ = std::fs::remove_dir_all(&dir);
        }

        #[tokio::test]
        async fn exhausted_reconnects_fail_the_session() {
            let mut session = StreamSession::new(config_with_script("exit 3"));
            session.start("rtsp://unreachable/stream").await.unwrap();
            wait_for_status(&session, |s| matches!(s, SessionStatus::Failed { .. })).await;
            assert!(!session.is_running());

            session.stop().await;
            assert_eq!(*session.status().borrow(), SessionStatus::Idle);
        }

        #[tokio::test]
        async fn spawn_failure_is_reported_to_caller() {
            let mut config = Config::default();
            config.decoder.program = "/nonexistent/cam-decoder".into();
            let mut session = StreamSession::new(config);
            let err = session.start("rtsp://cam/stream").await.unwrap_err();
            assert!(matches!(err, SessionError::Supervisor(SupervisorError::Spawn(_))));
            assert!(matches!(
                *session.status().borrow(),
                SessionStatus::Failed { .. }
            ));
        }

        #[tokio::test]
        async fn restart_replaces_source_and_stop_is_idempotent() {
            let mut session = StreamSession::new(config_with_script("sleep 30"));
            session.start("rtsp://cam/one").await.unwrap();
            assert!(session.is_running());
            assert_eq!(session.source(), Some("rtsp://cam/one"));

            session.start("rtsp://cam/two").await.unwrap();
            assert_eq!(session.source(), Some("rtsp://cam/two"));
            assert_eq!(
                *session.status().borrow(),
                SessionStatus::Running {
                    source: "rtsp://cam/two".into()
                }
            );

            timeout(Duration::from_secs(5), session.stop())
                .await
                .expect("stop hung");
            assert!(!session.is_running());
            assert!(session.source().is_none());
            session.stop().await;
            assert_eq!(*session.status().borrow(), SessionStatus::Idle);
        }

        #[tokio::test]
        async fn stop_discards_in_flight_score() {
            let dir = scratch_dir("inflight");
            let mut stream = tiny_jpeg(0);
            stream.extend(tiny_jpeg(1));
            let file = dir.join("stream.mjpeg");
            std::fs::write(&file, &stream).unwrap();

            // Emit both frames, then stay alive so the session keeps running.
            let mut session = StreamSession::with_scorer(
                config_with_script("cat '{uri}'; sleep 30"),
                Arc::new(SlowScorer),
            );
            let mut frames_rx = session.frames();
            let mut motion_rx = session.motion_events();
            session.start(file.to_str().unwrap()).await.unwrap();

            for _ in 0..2 {
                timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
            }
            // The score for frame 1 is now being computed.
            session.stop().await;
            tokio::time::sleep(Duration::from_millis(500)).await;

            assert!(drain(&mut motion_rx).is_empty());
            assert!(session.current_frame().is_none());
            let _ = std::fs::remove_dir_all(&dir);
        }
    }
}
