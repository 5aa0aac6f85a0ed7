//! Command sequencer: turns the unordered invocation stream into a strictly
//! one-at-a-time playback pipeline.
//!
//! Every sound or visual invocation is queued (FIFO) and processed only after
//! the previous one has finished and the cool-down has elapsed. A skip raised
//! on the control path cancels whatever is currently playing; it never
//! touches queued invocations. A failing (or panicking) invocation is logged
//! and the queue moves on.

use crate::alert::{self, AlertDefaults, AlertInvocation, ResolvedAlert};
use crate::cache::{Asset, AssetCache, FileSource};
use crate::model::{CommandInvocation, PayloadType};
use crate::session::{ChannelSession, SessionProvider};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(1_000);

/// Renders audio. Completes when playback ends, fails when it cannot play.
/// Dropping the returned future abandons the playback.
pub trait PlaybackDriver: Send + Sync + 'static {
    fn play_audio(
        &self,
        asset: Arc<Asset>,
    ) -> impl Future<Output = Result<(), PlaybackError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    NoOutput,
    Failed(String),
    TimedOut(Duration),
    Disconnected,
}

impl fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOutput => write!(f, "no playback output connected"),
            Self::Failed(msg) => write!(f, "playback failed: {msg}"),
            Self::TimedOut(after) => write!(f, "playback timed out after {}ms", after.as_millis()),
            Self::Disconnected => write!(f, "playback output disconnected"),
        }
    }
}

impl Error for PlaybackError {}

#[derive(Debug)]
pub enum ProcessError {
    Fetch {
        file_name: String,
        source: Box<dyn Error + Send + Sync>,
    },
    Playback(PlaybackError),
    Panicked(String),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch { file_name, source } => write!(f, "failed to fetch {file_name}: {source}"),
            Self::Playback(err) => write!(f, "{err}"),
            Self::Panicked(msg) => write!(f, "invocation task panicked: {msg}"),
        }
    }
}

impl Error for ProcessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Fetch { source, .. } => Some(source.as_ref()),
            Self::Playback(err) => Some(err),
            Self::Panicked(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SequencerSettings {
    pub cooldown: Duration,
    pub alert_defaults: AlertDefaults,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            alert_defaults: AlertDefaults::default(),
        }
    }
}

pub type ActiveAlert = Option<Arc<AlertInvocation>>;

struct Shared<F, D> {
    cache: Arc<AssetCache<F>>,
    driver: Arc<D>,
    sessions: SessionProvider,
    settings: SequencerSettings,
    busy: watch::Sender<bool>,
    active_alert: watch::Sender<ActiveAlert>,
    skip: broadcast::Sender<()>,
    pending: Mutex<usize>,
}

/// Handle to the running pipeline. Cheap to clone; the queue task stops once
/// every handle is gone and the queue has drained.
pub struct Sequencer<F, D> {
    shared: Arc<Shared<F, D>>,
    jobs: mpsc::UnboundedSender<CommandInvocation>,
}

impl<F, D> Clone for Sequencer<F, D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            jobs: self.jobs.clone(),
        }
    }
}

impl<F: FileSource, D: PlaybackDriver> Sequencer<F, D> {
    pub fn spawn(
        cache: Arc<AssetCache<F>>,
        driver: Arc<D>,
        sessions: SessionProvider,
        settings: SequencerSettings,
    ) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (busy, _) = watch::channel(false);
        let (active_alert, _) = watch::channel(None);
        let (skip, _) = broadcast::channel(8);
        let shared = Arc::new(Shared {
            cache,
            driver,
            sessions,
            settings,
            busy,
            active_alert,
            skip,
            pending: Mutex::new(0),
        });
        tokio::spawn(run_queue(shared.clone(), jobs_rx));
        Self {
            shared,
            jobs: jobs_tx,
        }
    }

    /// Routes one invocation: control commands act immediately, everything
    /// else joins the queue.
    pub fn submit(&self, invocation: CommandInvocation) {
        if invocation.kind == PayloadType::Command {
            self.dispatch_control(&invocation);
        } else {
            self.enqueue(invocation);
        }
    }

    /// Cancels the active invocation, if any. Never affects queued ones.
    pub fn skip(&self) {
        tracing::info!("skipping current alert");
        let _ = self.shared.skip.send(());
    }

    pub fn busy(&self) -> watch::Receiver<bool> {
        self.shared.busy.subscribe()
    }

    pub fn active_alert(&self) -> watch::Receiver<ActiveAlert> {
        self.shared.active_alert.subscribe()
    }

    #[cfg(test)]
    pub fn cache(&self) -> &Arc<AssetCache<F>> {
        &self.shared.cache
    }

    /// Feeds every invocation published on `invocations` into the pipeline.
    pub fn attach(&self, mut invocations: broadcast::Receiver<CommandInvocation>) -> JoinHandle<()> {
        let sequencer = self.clone();
        tokio::spawn(async move {
            loop {
                match invocations.recv().await {
                    Ok(invocation) => sequencer.submit(invocation),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "invocation listener lagged, invocations dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn dispatch_control(&self, invocation: &CommandInvocation) {
        match invocation.payload_to_play.as_str() {
            "skip" => self.skip(),
            other => {
                tracing::error!(
                    command = other,
                    invoked_by = %invocation.invoked_by,
                    "invalid command received"
                );
            }
        }
    }

    fn enqueue(&self, invocation: CommandInvocation) {
        let mut pending = lock_pending(&self.shared.pending);
        tracing::debug!(
            command = %invocation.command_name,
            queued = *pending,
            "queueing invocation"
        );
        if self.jobs.send(invocation).is_err() {
            tracing::error!("invocation queue closed, dropping invocation");
            return;
        }
        *pending += 1;
        self.shared.busy.send_if_modified(|busy| !std::mem::replace(busy, true));
    }
}

async fn run_queue<F: FileSource, D: PlaybackDriver>(
    shared: Arc<Shared<F, D>>,
    mut jobs: mpsc::UnboundedReceiver<CommandInvocation>,
) {
    while let Some(invocation) = jobs.recv().await {
        shared.run_one(invocation).await;
        shared.finish_one();
    }
    tracing::debug!("invocation queue closed");
}

impl<F: FileSource, D: PlaybackDriver> Shared<F, D> {
    async fn run_one(self: &Arc<Self>, invocation: CommandInvocation) {
        // Skips only reach a running invocation; one still waiting for a
        // session is not active yet and stays queued.
        let session = self.sessions.wait().await;
        let command_name = invocation.command_name.clone();
        let mut skip_rx = self.skip.subscribe();

        let mut worker = {
            let shared = self.clone();
            tokio::spawn(async move { shared.process(invocation, session).await })
        };

        let outcome = tokio::select! {
            joined = &mut worker => match joined {
                Ok(result) => result,
                Err(err) => Err(ProcessError::Panicked(err.to_string())),
            },
            _ = skip_rx.recv() => {
                worker.abort();
                // A poll already running elsewhere can still publish the alert;
                // only clear once the task is gone.
                let _ = (&mut worker).await;
                tracing::debug!(command = %command_name, "alert short circuited");
                Ok(())
            }
        };

        self.clear_active_alert();
        if let Err(err) = outcome {
            tracing::error!(command = %command_name, error = %err, "failed to process command");
        }

        tracing::debug!(cooldown_ms = self.settings.cooldown.as_millis() as u64, "waiting before next invocation");
        tokio::time::sleep(self.settings.cooldown).await;
    }

    fn finish_one(&self) {
        let mut pending = lock_pending(&self.pending);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            tracing::debug!("invocation queue drained");
            self.busy.send_if_modified(|busy| std::mem::replace(busy, false));
        }
    }

    fn clear_active_alert(&self) {
        self.active_alert
            .send_if_modified(|active| active.take().is_some());
    }

    async fn process(
        &self,
        invocation: CommandInvocation,
        session: ChannelSession,
    ) -> Result<(), ProcessError> {
        match invocation.kind {
            PayloadType::Sound => self.play_sound(&invocation, &session).await,
            PayloadType::Visual => self.show_visual_alert(invocation, &session).await,
            _ => Ok(()),
        }
    }

    async fn play_sound(
        &self,
        invocation: &CommandInvocation,
        session: &ChannelSession,
    ) -> Result<(), ProcessError> {
        let asset = self.resolve(&invocation.payload_to_play, session).await?;
        tracing::debug!(file_name = %asset.file_name, "start playing file");
        self.driver
            .play_audio(asset)
            .await
            .map_err(ProcessError::Playback)?;
        tracing::debug!(command = %invocation.command_name, "play sound completed");
        Ok(())
    }

    async fn show_visual_alert(
        &self,
        invocation: CommandInvocation,
        session: &ChannelSession,
    ) -> Result<(), ProcessError> {
        if alert::file_reference(&invocation.payload_to_play).is_none() {
            tracing::debug!(command = %invocation.command_name, "visual payload has no file reference, nothing to show");
            return Ok(());
        }

        let properties =
            alert::parse_alert_payload(&invocation.payload_to_play, &self.settings.alert_defaults);
        let image = self.resolve(&properties.image, session).await?;
        let audio = match properties.audio.as_deref() {
            Some(name) => Some(self.resolve(name, session).await?),
            None => None,
        };

        let duration = Duration::from_millis(properties.duration_ms);
        let alert = Arc::new(AlertInvocation {
            invocation,
            alert: ResolvedAlert {
                properties,
                image,
                audio: audio.clone(),
            },
        });
        tracing::debug!(
            command = %alert.invocation.command_name,
            duration_ms = duration.as_millis() as u64,
            has_audio = audio.is_some(),
            "start playing alert"
        );
        self.active_alert.send_replace(Some(alert));

        let timer = async {
            tokio::time::sleep(duration).await;
            Ok::<(), ProcessError>(())
        };
        let sound = async {
            match audio {
                Some(asset) => self
                    .driver
                    .play_audio(asset)
                    .await
                    .map_err(ProcessError::Playback),
                None => Ok(()),
            }
        };
        tokio::try_join!(timer, sound)?;

        tracing::debug!("alert finished playing");
        self.clear_active_alert();
        Ok(())
    }

    async fn resolve(
        &self,
        file_name: &str,
        session: &ChannelSession,
    ) -> Result<Arc<Asset>, ProcessError> {
        self.cache
            .resolve(file_name, session)
            .await
            .map_err(|err| ProcessError::Fetch {
                file_name: file_name.to_string(),
                source: Box::new(err),
            })
    }
}

fn lock_pending(pending: &Mutex<usize>) -> std::sync::MutexGuard<'_, usize> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{FakeFetchError, FakeSource};
    use bytes::Bytes;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Start(String),
        End(String),
        Dropped(String),
    }

    /// Records playback events with their (virtual) timestamps.
    #[derive(Default)]
    struct FakeDriver {
        log: Mutex<Vec<(Event, Instant)>>,
        lengths: Mutex<HashMap<String, Duration>>,
        failing: Mutex<HashSet<String>>,
        hanging: Mutex<HashSet<String>>,
        panicking: Mutex<HashSet<String>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    struct ActiveGuard<'a> {
        driver: &'a FakeDriver,
        name: String,
        finished: bool,
    }

    impl Drop for ActiveGuard<'_> {
        fn drop(&mut self) {
            self.driver.active.fetch_sub(1, Ordering::SeqCst);
            if !self.finished {
                self.driver.record(Event::Dropped(self.name.clone()));
            }
        }
    }

    impl FakeDriver {
        fn record(&self, event: Event) {
            self.log.lock().unwrap().push((event, Instant::now()));
        }

        fn events(&self) -> Vec<Event> {
            self.log.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
        }

        fn time_of(&self, event: &Event) -> Instant {
            self.log
                .lock()
                .unwrap()
                .iter()
                .find(|(e, _)| e == event)
                .map(|(_, t)| *t)
                .unwrap()
        }

        fn set_length(&self, name: &str, length: Duration) {
            self.lengths.lock().unwrap().insert(name.to_string(), length);
        }
    }

    impl PlaybackDriver for FakeDriver {
        fn play_audio(
            &self,
            asset: Arc<Asset>,
        ) -> impl Future<Output = Result<(), PlaybackError>> + Send {
            async move {
                let name = asset.file_name.clone();
                let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active.fetch_max(now_active, Ordering::SeqCst);
                let mut guard = ActiveGuard {
                    driver: self,
                    name: name.clone(),
                    finished: false,
                };
                self.record(Event::Start(name.clone()));

                let panics = self.panicking.lock().unwrap().contains(&name);
                let hangs = self.hanging.lock().unwrap().contains(&name);
                let fails = self.failing.lock().unwrap().contains(&name);
                if panics {
                    panic!("driver exploded on {name}");
                }
                if hangs {
                    std::future::pending::<()>().await;
                }
                let length = self
                    .lengths
                    .lock()
                    .unwrap()
                    .get(&name)
                    .copied()
                    .unwrap_or(Duration::from_millis(100));
                tokio::time::sleep(length).await;

                guard.finished = true;
                self.record(Event::End(name.clone()));
                if fails {
                    return Err(PlaybackError::Failed(format!("cannot decode {name}")));
                }
                Ok(())
            }
        }
    }

    type TestSequencer = Sequencer<FakeSource, FakeDriver>;

    fn setup(session: Option<ChannelSession>) -> (TestSequencer, Arc<FakeDriver>, SessionProvider) {
        let cache = Arc::new(AssetCache::new(FakeSource::default()));
        let driver = Arc::new(FakeDriver::default());
        let sessions = SessionProvider::new(session);
        let seq = Sequencer::spawn(
            cache,
            driver.clone(),
            sessions.clone(),
            SequencerSettings::default(),
        );
        (seq, driver, sessions)
    }

    fn session() -> Option<ChannelSession> {
        Some(ChannelSession::new("chan", "tok"))
    }

    fn invocation(kind: PayloadType, payload: &str) -> CommandInvocation {
        CommandInvocation {
            kind,
            invoked_by: "viewer".to_string(),
            invoked_from: "chan".to_string(),
            command_name: format!("!{}", payload.lines().next().unwrap_or_default()),
            payload_to_play: payload.to_string(),
            invoked_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn sound(name: &str) -> CommandInvocation {
        invocation(PayloadType::Sound, name)
    }

    async fn drained(seq: &TestSequencer) {
        let mut busy = seq.busy();
        tokio::time::timeout(Duration::from_secs(600), busy.wait_for(|b| !*b))
            .await
            .expect("queue never drained")
            .unwrap();
    }

    fn start(name: &str) -> Event {
        Event::Start(name.to_string())
    }

    fn end(name: &str) -> Event {
        Event::End(name.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn plays_in_arrival_order_one_at_a_time_with_cooldown() {
        let (seq, driver, _) = setup(session());
        for name in ["a.mp3", "b.mp3", "c.mp3"] {
            seq.submit(sound(name));
        }
        assert!(*seq.busy().borrow());
        drained(&seq).await;

        assert_eq!(
            driver.events(),
            vec![
                start("a.mp3"),
                end("a.mp3"),
                start("b.mp3"),
                end("b.mp3"),
                start("c.mp3"),
                end("c.mp3"),
            ]
        );
        assert_eq!(driver.max_active.load(Ordering::SeqCst), 1);
        let gap = driver.time_of(&start("b.mp3")) - driver.time_of(&end("a.mp3"));
        assert!(gap >= DEFAULT_COOLDOWN, "gap was {gap:?}");
        assert!(!*seq.busy().borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_does_not_stall_the_queue() {
        let (seq, driver, _) = setup(session());
        seq.cache().source().fail("missing.mp3");
        seq.submit(sound("missing.mp3"));
        seq.submit(sound("ok.mp3"));
        drained(&seq).await;
        assert_eq!(driver.events(), vec![start("ok.mp3"), end("ok.mp3")]);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_error_and_panic_do_not_stall_the_queue() {
        let (seq, driver, _) = setup(session());
        driver.failing.lock().unwrap().insert("broken.mp3".to_string());
        driver.panicking.lock().unwrap().insert("boom.mp3".to_string());
        seq.submit(sound("broken.mp3"));
        seq.submit(sound("boom.mp3"));
        seq.submit(sound("fine.mp3"));
        drained(&seq).await;

        let events = driver.events();
        assert!(events.contains(&end("broken.mp3")));
        assert!(events.contains(&start("boom.mp3")));
        assert_eq!(events.last(), Some(&end("fine.mp3")));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_abandons_active_visual_and_next_starts() {
        let (seq, driver, _) = setup(session());
        let mut active = seq.active_alert();

        seq.submit(invocation(
            PayloadType::Visual,
            "file://big.png\nduration=10s\ntext=hello",
        ));
        seq.submit(sound("next.mp3"));

        active.wait_for(|a| a.is_some()).await.unwrap();
        let shown_at = Instant::now();
        {
            let current = active.borrow();
            let alert = &current.as_ref().unwrap().alert;
            assert_eq!(alert.properties.text, "hello");
            assert_eq!(alert.image.file_name, "big.png");
        }

        seq.skip();
        active.wait_for(|a| a.is_none()).await.unwrap();
        drained(&seq).await;

        assert_eq!(driver.events(), vec![start("next.mp3"), end("next.mp3")]);
        let next_started = driver.time_of(&start("next.mp3"));
        assert!(next_started - shown_at < Duration::from_secs(10));
        assert!(seq.active_alert().borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn skip_drops_hanging_sound_playback() {
        let (seq, driver, _) = setup(session());
        driver.hanging.lock().unwrap().insert("forever.mp3".to_string());
        seq.submit(sound("forever.mp3"));
        seq.submit(sound("after.mp3"));

        while !driver.events().contains(&start("forever.mp3")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        seq.skip();
        drained(&seq).await;

        assert_eq!(
            driver.events(),
            vec![
                start("forever.mp3"),
                Event::Dropped("forever.mp3".to_string()),
                start("after.mp3"),
                end("after.mp3"),
            ]
        );
        assert_eq!(driver.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_command_cancels_and_unknown_command_is_ignored() {
        let (seq, driver, _) = setup(session());
        driver.hanging.lock().unwrap().insert("loop.mp3".to_string());

        seq.submit(invocation(PayloadType::Command, "explode"));
        assert!(!*seq.busy().borrow());

        seq.submit(sound("loop.mp3"));
        while !driver.events().contains(&start("loop.mp3")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        seq.submit(invocation(PayloadType::Command, "explode"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(*seq.busy().borrow(), "unknown command must not cancel");

        seq.submit(invocation(PayloadType::Command, "skip"));
        drained(&seq).await;
        assert!(driver.events().contains(&Event::Dropped("loop.mp3".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_with_nothing_active_is_not_remembered() {
        let (seq, driver, _) = setup(session());
        seq.skip();
        seq.submit(sound("a.mp3"));
        drained(&seq).await;
        assert_eq!(driver.events(), vec![start("a.mp3"), end("a.mp3")]);
    }

    #[tokio::test(start_paused = true)]
    async fn visual_waits_for_the_longer_of_duration_and_audio() {
        let (seq, driver, _) = setup(session());
        driver.set_length("long.mp3", Duration::from_secs(3));
        driver.set_length("short.mp3", Duration::from_millis(500));
        let mut active = seq.active_alert();

        seq.submit(invocation(
            PayloadType::Visual,
            "file://a.png\nduration=1s\naudio=long.mp3",
        ));
        active.wait_for(|a| a.is_some()).await.unwrap();
        let shown = Instant::now();
        active.wait_for(|a| a.is_none()).await.unwrap();
        let visible = Instant::now() - shown;
        assert!(visible >= Duration::from_secs(3), "visible {visible:?}");
        assert!(visible < Duration::from_secs(4), "visible {visible:?}");
        drained(&seq).await;

        seq.submit(invocation(
            PayloadType::Visual,
            "file://b.png\nduration=4s\naudio=short.mp3",
        ));
        active.wait_for(|a| a.is_some()).await.unwrap();
        let shown = Instant::now();
        active.wait_for(|a| a.is_none()).await.unwrap();
        let visible = Instant::now() - shown;
        assert!(visible >= Duration::from_secs(4), "visible {visible:?}");
        assert!(visible < Duration::from_secs(5), "visible {visible:?}");
        drained(&seq).await;

        assert_eq!(seq.cache().source().fetch_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn visual_without_file_reference_is_a_no_op() {
        let (seq, driver, _) = setup(session());
        let active = seq.active_alert();
        seq.submit(invocation(PayloadType::Visual, "just text"));
        seq.submit(invocation(PayloadType::Other(9), "whatever"));
        drained(&seq).await;
        assert!(active.borrow().is_none());
        assert!(!active.has_changed().unwrap());
        assert!(driver.events().is_empty());
        assert_eq!(seq.cache().source().fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_visual_audio_clears_the_alert() {
        let (seq, driver, _) = setup(session());
        driver.failing.lock().unwrap().insert("bad.mp3".to_string());
        seq.submit(invocation(
            PayloadType::Visual,
            "file://a.png\nduration=100ms\naudio=bad.mp3",
        ));
        seq.submit(sound("after.mp3"));
        drained(&seq).await;
        assert!(seq.active_alert().borrow().is_none());
        assert_eq!(driver.events().last(), Some(&end("after.mp3")));
    }

    #[tokio::test(start_paused = true)]
    async fn invocations_wait_for_a_session() {
        let (seq, driver, sessions) = setup(None);
        seq.submit(sound("a.mp3"));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(driver.events().is_empty());
        assert!(*seq.busy().borrow());

        sessions.set(ChannelSession::new("chan", "tok"));
        drained(&seq).await;
        assert_eq!(driver.events(), vec![start("a.mp3"), end("a.mp3")]);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_feeds_the_pipeline_from_a_broadcast() {
        let (seq, driver, _) = setup(session());
        let (tx, rx) = broadcast::channel(16);
        let listener = seq.attach(rx);
        tx.send(sound("x.mp3")).unwrap();
        tx.send(invocation(PayloadType::Command, "skip")).unwrap();
        tx.send(sound("y.mp3")).unwrap();
        drop(tx);
        listener.await.unwrap();
        drained(&seq).await;

        let events = driver.events();
        assert_eq!(events.last(), Some(&end("y.mp3")));
        assert!(events.contains(&start("y.mp3")));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_while_waiting_for_a_session_keeps_the_invocation_queued() {
        let (seq, driver, sessions) = setup(None);
        seq.submit(sound("a.mp3"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        seq.skip();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(driver.events().is_empty());

        sessions.set(ChannelSession::new("chan", "tok"));
        drained(&seq).await;
        assert_eq!(driver.events(), vec![start("a.mp3"), end("a.mp3")]);
    }

    /// Blocks its worker thread while fetching, so a skip can land mid-poll.
    #[derive(Default)]
    struct BlockingSource {
        entered: AtomicUsize,
    }

    impl FileSource for BlockingSource {
        type Error = FakeFetchError;

        fn fetch(
            &self,
            _session: &ChannelSession,
            file_name: &str,
        ) -> impl Future<Output = Result<Bytes, FakeFetchError>> + Send {
            let body = Bytes::from(format!("bytes of {file_name}"));
            async move {
                self.entered.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
                Ok(body)
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn skip_during_a_running_fetch_leaves_no_alert_behind() {
        let seq = Sequencer::spawn(
            Arc::new(AssetCache::new(BlockingSource::default())),
            Arc::new(FakeDriver::default()),
            SessionProvider::new(session()),
            SequencerSettings {
                cooldown: Duration::from_millis(50),
                ..SequencerSettings::default()
            },
        );
        seq.submit(invocation(PayloadType::Visual, "file://slow.png\nduration=60000"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while seq.cache().source().entered.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        seq.skip();

        let mut busy = seq.busy();
        tokio::time::timeout(Duration::from_secs(5), busy.wait_for(|b| !*b))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(seq.active_alert().borrow().is_none());
    }
}
