//! The adaptive player: a single worker task owning all manifest, period
//! and segment-sequencing state.
//!
//! Every mutating public call becomes a typed command on an mpsc queue and
//! is executed exclusively by the worker, which is therefore the only
//! writer of playback state and the only caller into the manifest tree.
//! Suspension points (`NeedElement`, not-yet-published live segments) turn
//! into retry deadlines on a queue, never blocking sleeps.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use kinema_core::{MediaTime, SequenceState, StreamType, TimeRange};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventEmitter, PlayerEvent};
use crate::manifest::{ManifestDash, PeriodLookup};
use crate::period::{
    PlayPeriod, PlayStartOptions, PlayStartPosition, SegmentLookup, StreamPreferences,
    TrackChangeOutcome,
};
use crate::search::SearchType;
use crate::segment::SegmentRequest;
use crate::services::SessionServices;
use crate::state::{BufferingReason, PlaybackState, PlayerState};

#[derive(Clone, Debug)]
pub struct SeekParams {
    pub time: MediaTime,
    /// Scrubbing seeks may be replaced mid-flight by newer ones.
    pub scrubbing: bool,
}

#[derive(Debug)]
pub enum PlayerCommand {
    /// Begin playback. `position` overrides the default start (live edge
    /// minus desired latency for live, range start for VoD).
    Open { position: Option<MediaTime> },
    SeekTo(SeekParams),
    Pause,
    Resume,
    SetPlaybackRange(TimeRange),
    SetLooping(bool),
    SelectTrack {
        stream_type: StreamType,
        prefs: StreamPreferences,
    },
    /// Stream reader finished a segment; drives the next-segment chain.
    SegmentCompleted { request: Box<SegmentRequest> },
    /// Stream reader gave up on a segment after transport-level retries.
    SegmentFailed {
        request: Box<SegmentRequest>,
        replace_with_filler: bool,
    },
    Close,
}

/// Seek coalescing state. The pending request is replaceable until the
/// worker takes it; an in-flight scrubbing seek yields to a newer request,
/// a non-scrubbing one is preserved to completion.
#[derive(Debug, Default)]
struct SeekVars {
    pending: Option<SeekParams>,
    active: Option<SeekParams>,
    last_completed: Option<MediaTime>,
}

#[derive(Debug, PartialEq)]
enum SeekDisposition {
    Queued,
    /// Within epsilon of the last finished seek: report completion, fetch
    /// nothing.
    AlreadyThere,
}

impl SeekVars {
    fn request(&mut self, params: SeekParams, epsilon: MediaTime) -> SeekDisposition {
        if self.active.is_none() && self.pending.is_none() {
            if let Some(last) = self.last_completed {
                let distance = if params.time > last {
                    params.time - last
                } else {
                    last - params.time
                };
                if distance.is_valid() && distance <= epsilon {
                    return SeekDisposition::AlreadyThere;
                }
            }
        }
        self.pending = Some(params);
        SeekDisposition::Queued
    }

    fn take_pending(&mut self) -> Option<SeekParams> {
        match &self.active {
            Some(active) if !active.scrubbing => None,
            _ => {
                let next = self.pending.take()?;
                self.active = Some(next.clone());
                Some(next)
            }
        }
    }

    fn finish(&mut self, position: MediaTime) {
        self.active = None;
        self.last_completed = Some(position);
    }
}

/// What a scheduled retry will do when its deadline arrives.
enum RetryTask {
    Start,
    Next { current: Box<SegmentRequest> },
    Retry {
        current: Box<SegmentRequest>,
        replace_with_filler: bool,
    },
}

struct ScheduledRetry {
    at: Instant,
    task: RetryTask,
}

/// Public handle. Cheap to clone; all methods enqueue commands.
#[derive(Clone)]
pub struct PlayerHandle {
    commands: mpsc::Sender<PlayerCommand>,
    playback: Arc<PlaybackState>,
    events: EventEmitter,
    cancel: CancellationToken,
}

impl PlayerHandle {
    pub fn snapshot(&self) -> crate::state::PlaybackSnapshot {
        self.playback.snapshot()
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub async fn send(&self, command: PlayerCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub async fn open(&self, position: Option<MediaTime>) -> bool {
        self.send(PlayerCommand::Open { position }).await
    }

    pub async fn seek_to(&self, params: SeekParams) -> bool {
        self.send(PlayerCommand::SeekTo(params)).await
    }

    pub async fn pause(&self) -> bool {
        self.send(PlayerCommand::Pause).await
    }

    pub async fn resume(&self) -> bool {
        self.send(PlayerCommand::Resume).await
    }

    pub async fn set_playback_range(&self, range: TimeRange) -> bool {
        self.send(PlayerCommand::SetPlaybackRange(range)).await
    }

    pub async fn set_looping(&self, looping: bool) -> bool {
        self.send(PlayerCommand::SetLooping(looping)).await
    }

    pub async fn select_track(&self, stream_type: StreamType, prefs: StreamPreferences) -> bool {
        self.send(PlayerCommand::SelectTrack { stream_type, prefs })
            .await
    }

    pub async fn close(&self) {
        let _ = self.send(PlayerCommand::Close).await;
        self.cancel.cancelled().await;
    }

    pub fn notify_segment_completed(&self, request: Box<SegmentRequest>) {
        let _ = self
            .commands
            .try_send(PlayerCommand::SegmentCompleted { request });
    }

    pub fn notify_segment_failed(&self, request: Box<SegmentRequest>, replace_with_filler: bool) {
        let _ = self.commands.try_send(PlayerCommand::SegmentFailed {
            request,
            replace_with_filler,
        });
    }
}

pub struct AdaptivePlayer;

#[derive(Clone, Debug)]
pub struct PlayerWorkerOptions {
    pub command_capacity: usize,
    pub event_capacity: usize,
    /// Seeks closer than this to the last finished seek are no-ops.
    pub seek_epsilon: MediaTime,
    pub cancel: Option<CancellationToken>,
    pub events: Option<tokio::sync::broadcast::Sender<PlayerEvent>>,
}

impl Default for PlayerWorkerOptions {
    fn default() -> Self {
        Self {
            command_capacity: 32,
            event_capacity: 32,
            seek_epsilon: MediaTime::from_millis(300),
            cancel: None,
            events: None,
        }
    }
}

impl AdaptivePlayer {
    /// Spawn the worker task and return the public handle.
    pub fn spawn(services: Arc<SessionServices>, options: PlayerWorkerOptions) -> PlayerHandle {
        let (tx, rx) = mpsc::channel(options.command_capacity.max(1));
        let playback = Arc::new(PlaybackState::new());
        let events = match &options.events {
            Some(sender) => EventEmitter::with_sender(sender.clone()),
            None => EventEmitter::new(options.event_capacity),
        };
        let cancel = options.cancel.clone().unwrap_or_default();
        let handle = PlayerHandle {
            commands: tx,
            playback: playback.clone(),
            events: events.clone(),
            cancel: cancel.clone(),
        };
        let worker = PlayerWorker {
            manifest: ManifestDash::new(services.clone()),
            services,
            playback,
            events,
            cancel,
            commands: rx,
            state: PlayerState::Idle,
            buffering_reason: None,
            sequence: SequenceState::new(),
            current_period: None,
            play_options: PlayStartOptions::default(),
            seek: SeekVars::default(),
            seek_epsilon: options.seek_epsilon,
            retries: VecDeque::new(),
            looping: false,
            paused: false,
            streams_ended: Vec::new(),
            streams_active: 0,
            announced_tracks: false,
        };
        tokio::spawn(worker.run());
        handle
    }
}

struct PlayerWorker {
    services: Arc<SessionServices>,
    manifest: ManifestDash,
    playback: Arc<PlaybackState>,
    events: EventEmitter,
    cancel: CancellationToken,
    commands: mpsc::Receiver<PlayerCommand>,
    state: PlayerState,
    buffering_reason: Option<BufferingReason>,
    sequence: SequenceState,
    current_period: Option<PlayPeriod>,
    play_options: PlayStartOptions,
    seek: SeekVars,
    seek_epsilon: MediaTime,
    retries: VecDeque<ScheduledRetry>,
    looping: bool,
    paused: bool,
    streams_ended: Vec<StreamType>,
    streams_active: usize,
    announced_tracks: bool,
}

impl PlayerWorker {
    async fn run(mut self) {
        loop {
            let next_deadline = self.retries.iter().map(|r| r.at).min();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => {
                    match command {
                        Some(PlayerCommand::Close) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                _ = deadline_sleep(next_deadline) => {
                    self.run_due_retries();
                }
            }
            self.process_pending_seek();
        }
        self.set_state(PlayerState::Idle);
        self.cancel.cancel();
    }

    fn handle_command(&mut self, command: PlayerCommand) {
        if self.state == PlayerState::Error {
            // An error close is in progress; only Close gets through (and
            // that is handled by the loop itself).
            return;
        }
        match command {
            PlayerCommand::Open { position } => self.handle_open(position),
            PlayerCommand::SeekTo(params) => {
                if self.seek.request(params.clone(), self.seek_epsilon)
                    == SeekDisposition::AlreadyThere
                {
                    debug!(time = %params.time, "seek target within epsilon, completing in place");
                    self.events.emit(PlayerEvent::SeekCompleted {
                        position: params.time,
                    });
                }
            }
            PlayerCommand::Pause => {
                self.paused = true;
                if matches!(self.state, PlayerState::Playing) {
                    self.set_state(PlayerState::Paused);
                    self.playback.update(|s| s.playback_rate = 0.0);
                }
            }
            PlayerCommand::Resume => {
                self.paused = false;
                if matches!(self.state, PlayerState::Paused) {
                    self.set_state(PlayerState::Playing);
                    self.playback.update(|s| s.playback_rate = 1.0);
                }
            }
            PlayerCommand::SetPlaybackRange(range) => {
                self.play_options.playback_range = range;
            }
            PlayerCommand::SetLooping(looping) => {
                self.looping = looping;
                self.playback.update(|s| s.is_looping = looping);
            }
            PlayerCommand::SelectTrack { stream_type, prefs } => {
                self.handle_track_selection(stream_type, prefs);
            }
            PlayerCommand::SegmentCompleted { request } => {
                self.handle_segment_completed(*request);
            }
            PlayerCommand::SegmentFailed {
                request,
                replace_with_filler,
            } => {
                self.schedule(Duration::ZERO, RetryTask::Retry {
                    current: request,
                    replace_with_filler,
                });
            }
            PlayerCommand::Close => unreachable!("handled by the loop"),
        }
    }

    fn handle_open(&mut self, position: Option<MediaTime>) {
        self.set_state(PlayerState::ParsingManifest);
        if self.manifest.current_document().is_none() {
            self.post_error("no manifest available");
            return;
        }
        self.set_state(PlayerState::PreparingStreams);

        let start = position.unwrap_or_else(|| self.default_start_position());
        self.playback.update(|s| {
            s.duration = self.manifest.duration();
            s.seekable_range = self.manifest.seekable_time_range();
        });
        self.begin_buffering(BufferingReason::Initial, start);
    }

    fn default_start_position(&self) -> MediaTime {
        if self.manifest.is_live() {
            // Live: start behind the edge by the desired latency, not at
            // segment zero.
            let seekable = self.manifest.seekable_time_range();
            if seekable.end.is_valid() {
                return seekable.end;
            }
        }
        self.play_options.playback_range.start
    }

    fn begin_buffering(&mut self, reason: BufferingReason, position: MediaTime) {
        self.buffering_reason = Some(reason);
        self.events.emit(PlayerEvent::BufferingBegin { reason });
        match reason {
            BufferingReason::Initial => self.set_state(PlayerState::Buffering),
            BufferingReason::Seeking => self.set_state(PlayerState::Seeking),
            BufferingReason::Rebuffering => self.set_state(PlayerState::Rebuffering),
        }
        // Only the initial buffering announces tracks: availability can
        // differ from the manifest's declared defaults once playback
        // actually starts.
        if reason == BufferingReason::Initial && !self.announced_tracks {
            self.announced_tracks = true;
            let tracks = self.manifest.track_metadata(None);
            self.playback.update(|s| s.tracks = tracks.clone());
            self.events.emit(PlayerEvent::TracksChanged { tracks });
        }
        self.playback.update(|s| {
            s.position = position;
            s.has_ended = false;
        });
        self.streams_ended.clear();
        self.start_at(position);
    }

    /// Resolve the period and composite starting request for `position`.
    fn start_at(&mut self, position: MediaTime) {
        let position = PlayStartPosition {
            time: position,
            options: self.play_options.clone(),
        };
        match self.manifest.find_play_period(&position, SearchType::Closest) {
            PeriodLookup::Found(mut period) => {
                period.load();
                period.prepare_for_play();
                let lookup = period.get_starting_segment(
                    self.sequence.index(),
                    &position,
                    SearchType::Closest,
                );
                self.current_period = Some(period);
                self.dispatch_start_lookup(lookup, position.time);
            }
            PeriodLookup::PastEos => self.handle_all_streams_ended(),
            PeriodLookup::TryAgainLater(after) => {
                self.schedule(after, RetryTask::Start);
            }
            PeriodLookup::NotLoaded => self.post_error("manifest disappeared during start"),
        }
    }

    fn dispatch_start_lookup(&mut self, lookup: SegmentLookup, position: MediaTime) {
        match lookup {
            SegmentLookup::Found(composite) => {
                let first_pts = composite.first_pts();
                self.streams_active = composite.dependent_streams.len();
                for request in composite.dependent_streams.iter() {
                    if request.is_eos_segment {
                        self.streams_ended.extend(request.stream_type);
                        self.streams_active -= 1;
                        continue;
                    }
                    self.emit_segment_requested(request);
                    self.services
                        .stream_reader
                        .add_request(Arc::new(request.clone()));
                }
                let position = if first_pts.is_valid() { first_pts } else { position };
                self.playback.update(|s| s.position = position);
                self.finish_buffering(position);
            }
            SegmentLookup::TryAgainLater(after) => {
                self.schedule(after, RetryTask::Start);
            }
            SegmentLookup::PastEos => self.handle_all_streams_ended(),
            SegmentLookup::NotFound(reason) => {
                // The period itself went away; resolve from scratch.
                debug!(reason = %reason, "starting segment unresolvable, retrying lookup");
                self.current_period = None;
                self.schedule(Duration::from_millis(100), RetryTask::Start);
            }
        }
    }

    fn finish_buffering(&mut self, position: MediaTime) {
        if let Some(reason) = self.buffering_reason.take() {
            self.events.emit(PlayerEvent::BufferingEnd { reason });
        }
        if self.seek.active.is_some() {
            self.seek.finish(position);
            self.events.emit(PlayerEvent::SeekCompleted { position });
        }
        if self.paused {
            self.set_state(PlayerState::Paused);
            self.playback.update(|s| s.playback_rate = 0.0);
        } else {
            self.set_state(PlayerState::Playing);
            self.playback.update(|s| s.playback_rate = 1.0);
        }
    }

    fn process_pending_seek(&mut self) {
        if self.state == PlayerState::Idle || self.state == PlayerState::Error {
            return;
        }
        let Some(params) = self.seek.take_pending() else {
            return;
        };
        // A new timeline epoch: same wall-clock PTS values may repeat.
        self.sequence.advance_primary();
        self.current_period = None;
        self.retries.clear();
        self.begin_buffering(BufferingReason::Seeking, params.time);
    }

    fn handle_track_selection(&mut self, stream_type: StreamType, prefs: StreamPreferences) {
        let Some(period) = self.current_period.as_mut() else {
            return;
        };
        match period.change_track_preference(stream_type, prefs) {
            TrackChangeOutcome::StartOver => {
                // Video selection cannot change adaptively mid-period.
                self.sequence.advance_primary();
                let position = self.playback.position();
                self.current_period = None;
                self.begin_buffering(BufferingReason::Seeking, position);
            }
            TrackChangeOutcome::NewPeriodNeeded => {
                self.sequence.advance_secondary();
                let position = PlayStartPosition {
                    time: self.playback.position(),
                    options: self.play_options.clone(),
                };
                if let Some(period) = self.current_period.as_mut() {
                    let lookup = period.get_continuation_segment(
                        stream_type,
                        self.sequence.index(),
                        &position,
                    );
                    self.dispatch_stream_lookup(lookup, None);
                }
            }
        }
    }

    fn handle_segment_completed(&mut self, request: SegmentRequest) {
        if request.timestamp_sequence_index != self.sequence.index() {
            // Stale epoch (completed across a seek); drop it.
            return;
        }
        let end = request.first_pts() + request.segment.duration_time();
        if end.is_valid() {
            self.playback.update(|s| {
                s.position = end;
                s.current_live_latency =
                    self.manifest
                        .calculate_current_live_latency(end, MediaTime::invalid(), true);
            });
        }
        let Some(period) = self.current_period.as_mut() else {
            return;
        };
        let lookup = period.get_next_segment(&request, &self.play_options);
        self.dispatch_stream_lookup(lookup, Some(Box::new(request)));
    }

    /// Dispatch the outcome of a single-stream segment lookup, `current`
    /// being the request it continued from (for retries and period moves).
    fn dispatch_stream_lookup(
        &mut self,
        lookup: SegmentLookup,
        current: Option<Box<SegmentRequest>>,
    ) {
        match lookup {
            SegmentLookup::Found(request) => {
                if request.insert_filler_data {
                    if let Some(stream_type) = request.stream_type {
                        self.events.emit(PlayerEvent::SegmentUnavailable {
                            stream_type,
                            number: request.segment.number,
                        });
                    }
                }
                self.emit_segment_requested(&request);
                self.services.stream_reader.add_request(Arc::new(*request));
            }
            SegmentLookup::TryAgainLater(after) => {
                if let Some(current) = current {
                    self.schedule(after, RetryTask::Next { current });
                } else {
                    self.schedule(after, RetryTask::Start);
                }
            }
            SegmentLookup::PastEos => {
                let Some(current) = current else {
                    self.handle_all_streams_ended();
                    return;
                };
                self.advance_to_next_period(*current);
            }
            SegmentLookup::NotFound(reason) => {
                warn!(reason = %reason, "segment lookup failed, re-resolving period");
                self.current_period = None;
                self.schedule(Duration::from_millis(100), RetryTask::Start);
            }
        }
    }

    /// The current period is exhausted for this stream: move to the next
    /// period, or mark the stream ended when there is none.
    fn advance_to_next_period(&mut self, current: SegmentRequest) {
        match self.manifest.find_next_play_period(&current) {
            PeriodLookup::Found(mut period) => {
                period.load();
                period.prepare_for_play();
                let lookup = period.get_next_segment(&current, &self.play_options);
                self.current_period = Some(period);
                self.dispatch_stream_lookup(lookup, Some(Box::new(current)));
            }
            PeriodLookup::TryAgainLater(after) => {
                self.schedule(after, RetryTask::Next {
                    current: Box::new(current),
                });
            }
            PeriodLookup::PastEos | PeriodLookup::NotLoaded => {
                if let Some(stream_type) = current.stream_type {
                    if !self.streams_ended.contains(&stream_type) {
                        self.streams_ended.push(stream_type);
                    }
                    if self.streams_ended.len() >= self.streams_active.max(1) {
                        self.handle_all_streams_ended();
                    }
                }
            }
        }
    }

    fn handle_all_streams_ended(&mut self) {
        if self.looping {
            debug!("all streams ended, looping");
            self.sequence.advance_primary();
            self.playback.update(|s| s.loop_count += 1);
            let start = self.play_options.playback_range.start;
            self.begin_buffering(BufferingReason::Seeking, start);
            return;
        }
        self.events.emit(PlayerEvent::EndOfStream);
        self.playback.update(|s| {
            s.has_ended = true;
            s.playback_rate = 0.0;
        });
        self.set_state(PlayerState::Paused);
    }

    fn run_due_retries(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.retries.len() {
            if self.retries[i].at <= now {
                if let Some(retry) = self.retries.remove(i) {
                    due.push(retry);
                }
            } else {
                i += 1;
            }
        }
        for retry in due {
            match retry.task {
                RetryTask::Start => {
                    let position = self.playback.position();
                    self.start_at(position);
                }
                RetryTask::Next { current } => {
                    if let Some(period) = self.current_period.as_mut() {
                        let lookup = period.get_next_segment(&current, &self.play_options);
                        self.dispatch_stream_lookup(lookup, Some(current));
                    }
                }
                RetryTask::Retry {
                    current,
                    replace_with_filler,
                } => {
                    if let Some(period) = self.current_period.as_mut() {
                        let lookup = period.get_retry_segment(
                            &current,
                            &self.play_options,
                            replace_with_filler,
                        );
                        self.dispatch_stream_lookup(lookup, Some(current));
                    }
                }
            }
        }
    }

    fn schedule(&mut self, after: Duration, task: RetryTask) {
        self.retries.push_back(ScheduledRetry {
            at: Instant::now() + after,
            task,
        });
    }

    fn emit_segment_requested(&self, request: &SegmentRequest) {
        if let Some(stream_type) = request.stream_type {
            self.events.emit(PlayerEvent::SegmentRequested {
                stream_type,
                number: request.segment.number,
                url: request
                    .segment
                    .media_url
                    .url
                    .as_ref()
                    .map(|u| u.to_string()),
            });
        }
    }

    fn set_state(&mut self, to: PlayerState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.playback.update(|s| s.state = to);
        self.events.emit(PlayerEvent::StateChanged { from, to });
    }

    fn post_error(&mut self, message: &str) {
        warn!(message, "posting terminal playback error");
        self.events.emit(PlayerEvent::Error {
            message: message.to_string(),
        });
        // Tear down without delivering a final stopped event; the instance
        // may be destroyed while this unwinds.
        self.retries.clear();
        self.current_period = None;
        self.set_state(PlayerState::Error);
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seek(t: i64, scrubbing: bool) -> SeekParams {
        SeekParams {
            time: MediaTime::from_millis(t),
            scrubbing,
        }
    }

    const EPSILON: MediaTime = MediaTime::ZERO;

    fn epsilon_300() -> MediaTime {
        MediaTime::from_millis(300)
    }

    #[test]
    fn pending_seek_is_replaced_by_newer_request() {
        let mut vars = SeekVars::default();
        assert_eq!(vars.request(seek(1_000, false), EPSILON), SeekDisposition::Queued);
        assert_eq!(vars.request(seek(9_000, false), EPSILON), SeekDisposition::Queued);
        let taken = vars.take_pending().unwrap();
        assert_eq!(taken.time, MediaTime::from_millis(9_000));
        assert!(vars.take_pending().is_none());
    }

    #[test]
    fn non_scrubbing_active_seek_is_preserved() {
        let mut vars = SeekVars::default();
        vars.request(seek(1_000, false), EPSILON);
        vars.take_pending().unwrap();
        vars.request(seek(2_000, false), EPSILON);
        // The active seek has not finished; the new one must wait.
        assert!(vars.take_pending().is_none());
        vars.finish(MediaTime::from_millis(1_000));
        let next = vars.take_pending().unwrap();
        assert_eq!(next.time, MediaTime::from_millis(2_000));
    }

    #[test]
    fn scrubbing_active_seek_yields_to_newer_one() {
        let mut vars = SeekVars::default();
        vars.request(seek(1_000, true), EPSILON);
        vars.take_pending().unwrap();
        vars.request(seek(2_000, true), EPSILON);
        let replaced = vars.take_pending().unwrap();
        assert_eq!(replaced.time, MediaTime::from_millis(2_000));
    }

    #[test]
    fn seek_within_epsilon_is_already_there() {
        let mut vars = SeekVars::default();
        vars.request(seek(5_000, false), epsilon_300());
        vars.take_pending().unwrap();
        vars.finish(MediaTime::from_millis(5_000));
        assert_eq!(
            vars.request(seek(5_200, false), epsilon_300()),
            SeekDisposition::AlreadyThere
        );
        // Outside epsilon queues normally.
        assert_eq!(
            vars.request(seek(6_000, false), epsilon_300()),
            SeekDisposition::Queued
        );
    }
}
