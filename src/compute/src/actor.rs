// Copyright 2025 Tidewave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The asynchronous compute actor: executes one task cooperatively. Every
//! suspension happens at a message boundary; handlers never block.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use itertools::Itertools;
use tidewave_pb::data::{
    ChannelData, Checkpoint, CheckpointingMode, ComputeActorState, ComputeState, IssueProto,
    SerializedBatch, StatusIds, Watermark, WatermarksMode,
};
use tidewave_pb::task::{task_input_desc, task_output_desc, TaskDesc};
use tokio::sync::mpsc;

use crate::checkpoints::{
    CheckpointCoordinator, CheckpointEvent, ComputeActorCheckpointState, SourceState,
};
use crate::error::{ComputeError, ComputeResult};
use crate::metrics::ComputeActorMetrics;
use crate::task_runner::{
    AsyncInputSource, AsyncOutputSink, ChannelTracker, CheckpointRequest, ContinueRun,
    OutputChannelData, RunFinished, RunStatus, SourcePoll, TaskRunnerEvent, TaskRunnerRequest,
    WatermarkRequest,
};
use crate::watermarks::WatermarksTracker;

/// External events delivered to the compute actor's inbox.
#[derive(Debug)]
pub enum ComputeEvent {
    /// A batch pushed by an upstream channel.
    ChannelData { data: ChannelData, ack: bool },
    Runner(TaskRunnerEvent),
    ResumeExecution,
    StateRequest,
    PeerFinished { channel_id: u64 },
    InjectCheckpoint(Checkpoint),
    QuotaCleared { success: bool },
    Poison,
}

/// Notifications the actor sends to its executer.
#[derive(Debug)]
pub enum ComputeNotice {
    State(ComputeActorState),
}

#[derive(Debug)]
pub struct QuotaRequest {
    pub rate_limiter: String,
    pub resource: String,
    pub amount_ms: u64,
    /// Best-effort final flush; no clearance will be awaited.
    pub final_flush: bool,
}

#[derive(Clone, Debug)]
pub struct ComputeActorSettings {
    pub mkql_memory_limit: u64,
    pub initial_channel_free_space: i64,
    pub allowed_channels_overcommit: i64,
    /// CPU time accumulated before a quota request is worth sending.
    pub min_quoted_cpu_time: Duration,
    pub watermarks_mode: WatermarksMode,
    pub checkpointing_mode: CheckpointingMode,
}

impl Default for ComputeActorSettings {
    fn default() -> Self {
        Self {
            mkql_memory_limit: 64 << 20,
            initial_channel_free_space: 8 << 20,
            allowed_channels_overcommit: 1 << 20,
            min_quoted_cpu_time: Duration::from_millis(10),
            watermarks_mode: WatermarksMode::Disabled,
            checkpointing_mode: CheckpointingMode::Disabled,
        }
    }
}

struct InputChannelInfo {
    free_space: i64,
    watermarks_mode: WatermarksMode,
    checkpointing_mode: CheckpointingMode,
    /// Watermarks this channel is paused at, oldest first.
    pending_watermarks: VecDeque<Watermark>,
    pending_checkpoint: Option<Checkpoint>,
}

impl InputChannelInfo {
    fn is_paused(&self) -> bool {
        !self.pending_watermarks.is_empty() || self.pending_checkpoint.is_some()
    }
}

struct SourceInfo {
    free_space: i64,
    push_started: bool,
    finished: bool,
    source: Box<dyn AsyncInputSource>,
}

#[derive(Default)]
struct AsyncData {
    data: Vec<SerializedBatch>,
    watermark: Option<Watermark>,
    checkpoint: Option<Checkpoint>,
    finished: bool,
    changed: bool,
}

struct OutputChannelInfo {
    finished: bool,
    early_finish: bool,
    pop_started: bool,
    async_data: Option<AsyncData>,
}

struct SinkInfo {
    finished: bool,
    pop_started: bool,
    free_space_before_send: i64,
    sink: Box<dyn AsyncOutputSink>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PollResult {
    NewData,
    NoSpace,
}

#[derive(Default)]
struct ProcessOutputsState {
    inflight: usize,
    has_data_to_send: bool,
    data_was_sent: bool,
    all_outputs_finished: bool,
    last_run_status: Option<RunStatus>,
    last_pop_returned_no_data: bool,
}

#[derive(Default)]
struct ProcessSourcesState {
    inflight: usize,
}

struct TakeInputChannelData {
    ack: bool,
    channel_id: u64,
    watermark: Option<Watermark>,
}

pub struct AsyncComputeActor {
    task: TaskDesc,
    settings: ComputeActorSettings,

    inbox: mpsc::UnboundedReceiver<ComputeEvent>,
    self_tx: mpsc::UnboundedSender<ComputeEvent>,
    runner_tx: mpsc::UnboundedSender<TaskRunnerRequest>,
    executer_tx: mpsc::UnboundedSender<ComputeNotice>,
    quota_tx: Option<mpsc::UnboundedSender<QuotaRequest>>,
    channels: Box<dyn ChannelTracker>,
    metrics: Arc<ComputeActorMetrics>,

    input_channels: HashMap<u64, InputChannelInfo>,
    sources: BTreeMap<u32, SourceInfo>,
    output_channels: HashMap<u64, OutputChannelInfo>,
    sinks: BTreeMap<u32, SinkInfo>,

    watermarks: WatermarksTracker,
    checkpoints: Option<CheckpointCoordinator>,

    finished_output_channels: HashSet<u64>,
    finished_sinks: HashSet<u32>,

    take_input_channel_data_requests: HashMap<u64, TakeInputChannelData>,
    /// Watermark timestamp -> number of unacknowledged pushes preceding it.
    watermark_take_requests: HashMap<u64, u32>,
    cookie: u64,

    continue_run_event: Option<ContinueRun>,
    continue_run_inflight: bool,
    continue_run_start_wait: Option<Instant>,
    checkpoint_requested_from_task_runner: bool,
    program_state: Option<Vec<u8>>,
    mkql_memory_limit: u64,

    process_outputs_state: ProcessOutputsState,
    process_sources_state: ProcessSourcesState,
    last_poll_result: Option<PollResult>,

    cpu_time_spent: Duration,
    total_cpu_time: Duration,
    last_accounted_cpu_time: Duration,
    cpu_time_quota_asked: Option<Instant>,

    terminated: bool,
}

impl AsyncComputeActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: TaskDesc,
        settings: ComputeActorSettings,
        runner_tx: mpsc::UnboundedSender<TaskRunnerRequest>,
        channels: Box<dyn ChannelTracker>,
        executer_tx: mpsc::UnboundedSender<ComputeNotice>,
        checkpoint_sink: Option<mpsc::UnboundedSender<CheckpointEvent>>,
        quota_tx: Option<mpsc::UnboundedSender<QuotaRequest>>,
        mut source_impls: BTreeMap<u32, Box<dyn AsyncInputSource>>,
        mut sink_impls: BTreeMap<u32, Box<dyn AsyncOutputSink>>,
        metrics: Arc<ComputeActorMetrics>,
    ) -> (Self, mpsc::UnboundedSender<ComputeEvent>) {
        let (self_tx, inbox) = mpsc::unbounded_channel();

        let mut input_channels = HashMap::new();
        let mut sources = BTreeMap::new();
        let mut watermarks = WatermarksTracker::default();

        for (input_idx, input) in task.inputs.iter().enumerate() {
            if let Some(task_input_desc::Type::Source(_)) = &input.r#type {
                if let Some(source) = source_impls.remove(&(input_idx as u32)) {
                    sources.insert(
                        input_idx as u32,
                        SourceInfo {
                            free_space: settings.initial_channel_free_space,
                            push_started: false,
                            finished: false,
                            source,
                        },
                    );
                }
                continue;
            }
            for channel in &input.channels {
                input_channels.insert(
                    channel.id,
                    InputChannelInfo {
                        free_space: settings.initial_channel_free_space,
                        watermarks_mode: settings.watermarks_mode,
                        checkpointing_mode: settings.checkpointing_mode,
                        pending_watermarks: VecDeque::new(),
                        pending_checkpoint: None,
                    },
                );
                if settings.watermarks_mode != WatermarksMode::Disabled {
                    watermarks.register_input_channel(channel.id);
                }
            }
        }

        let mut output_channels = HashMap::new();
        let mut sinks = BTreeMap::new();
        for (output_idx, output) in task.outputs.iter().enumerate() {
            if let Some(task_output_desc::Type::Sink(_)) = &output.r#type {
                if let Some(sink) = sink_impls.remove(&(output_idx as u32)) {
                    sinks.insert(
                        output_idx as u32,
                        SinkInfo {
                            finished: false,
                            pop_started: false,
                            free_space_before_send: 0,
                            sink,
                        },
                    );
                }
                continue;
            }
            for channel in &output.channels {
                output_channels.insert(
                    channel.id,
                    OutputChannelInfo {
                        finished: false,
                        early_finish: false,
                        pop_started: false,
                        async_data: None,
                    },
                );
                if settings.watermarks_mode != WatermarksMode::Disabled {
                    watermarks.register_output_channel(channel.id);
                }
            }
        }

        let checkpoints =
            checkpoint_sink.map(|sink| CheckpointCoordinator::new(task.id, sink));
        let mkql_memory_limit = settings.mkql_memory_limit;

        let actor = Self {
            task,
            settings,
            inbox,
            self_tx: self_tx.clone(),
            runner_tx,
            executer_tx,
            quota_tx,
            channels,
            metrics,
            input_channels,
            sources,
            output_channels,
            sinks,
            watermarks,
            checkpoints,
            finished_output_channels: HashSet::new(),
            finished_sinks: HashSet::new(),
            take_input_channel_data_requests: HashMap::new(),
            watermark_take_requests: HashMap::new(),
            cookie: 0,
            continue_run_event: None,
            continue_run_inflight: false,
            continue_run_start_wait: None,
            checkpoint_requested_from_task_runner: false,
            program_state: None,
            mkql_memory_limit,
            process_outputs_state: ProcessOutputsState::default(),
            process_sources_state: ProcessSourcesState::default(),
            last_poll_result: None,
            cpu_time_spent: Duration::ZERO,
            total_cpu_time: Duration::ZERO,
            last_accounted_cpu_time: Duration::ZERO,
            cpu_time_quota_asked: None,
            terminated: false,
        };
        (actor, self_tx)
    }

    /// Runs the actor until the task completes, fails, or is poisoned.
    pub async fn run(mut self) {
        self.bootstrap();

        while !self.terminated {
            let Some(event) = self.inbox.recv().await else {
                break;
            };
            let started = Instant::now();
            self.handle_event(event);
            self.total_cpu_time += started.elapsed();
        }

        self.pass_away();
    }

    fn bootstrap(&mut self) {
        // Say hello to the executer.
        self.report_state(ComputeState::Executing, StatusIds::Success, Vec::new());
        self.continue_execute();
    }

    fn handle_event(&mut self, event: ComputeEvent) {
        match event {
            ComputeEvent::ChannelData { data, ack } => {
                if let Err(error) = self.take_input_channel_data(data, ack) {
                    self.internal_error(error);
                }
            }
            ComputeEvent::Runner(runner_event) => {
                if let Err(error) = self.handle_runner_event(runner_event) {
                    self.internal_error(error);
                }
            }
            ComputeEvent::ResumeExecution => self.do_execute(),
            ComputeEvent::StateRequest => self.on_state_request(),
            ComputeEvent::PeerFinished { channel_id } => {
                if let Err(error) = self.peer_finished(channel_id) {
                    self.internal_error(error);
                }
            }
            ComputeEvent::InjectCheckpoint(checkpoint) => {
                if let Some(checkpoints) = &mut self.checkpoints {
                    checkpoints.register_checkpoint(checkpoint, 0);
                    self.continue_execute();
                } else {
                    self.internal_error(ComputeError::NoCheckpointCoordinator);
                }
            }
            ComputeEvent::QuotaCleared { success } => self.on_cpu_quota_given(success),
            ComputeEvent::Poison => {
                self.terminated = true;
            }
        }
    }

    fn handle_runner_event(&mut self, event: TaskRunnerEvent) -> ComputeResult<()> {
        match event {
            TaskRunnerEvent::RunFinished(run) => self.on_run_finished(run),
            TaskRunnerEvent::InputChannelDataAck { cookie, free_space } => {
                self.on_input_channel_data_ack(cookie, free_space)
            }
            TaskRunnerEvent::SourceDataAck {
                index,
                free_space_left,
            } => self.on_source_data_ack(index, free_space_left),
            TaskRunnerEvent::OutputChannelData(data) => self.on_output_channel_data(data),
            TaskRunnerEvent::SinkData {
                index,
                batch,
                data_size,
                checkpoint_size,
                checkpoint,
                finished,
                changed,
            } => self.on_sink_data(index, batch, data_size, checkpoint_size, checkpoint, finished, changed),
        }
    }

    // === Inputs ===========================================================

    fn take_input_channel_data(&mut self, data: ChannelData, ack: bool) -> ComputeResult<()> {
        let channel_id = data.channel_id;
        let input_channel = self.input_channels.get_mut(&channel_id).ok_or(
            ComputeError::UnknownInputChannel {
                task_id: self.task.id,
                channel_id,
            },
        )?;

        let finished = data.finished;
        let mut watermark = None;
        if let Some(received) = data.watermark {
            watermark = Some(received);
            let channel_watermark_changed = self
                .watermarks
                .notify_in_channel_watermark_received(channel_id, received);
            if channel_watermark_changed {
                tracing::trace!(
                    channel = channel_id,
                    watermark = received.timestamp_us,
                    "pause input channel because of watermark"
                );
                input_channel.pending_watermarks.push_back(received);
            }
            *self
                .watermark_take_requests
                .entry(received.timestamp_us)
                .or_insert(0) += 1;
        }

        let batch = data.data.filter(|batch| batch.rows > 0);
        let _ = self.runner_tx.send(TaskRunnerRequest::InputChannelData {
            channel_id,
            batch,
            finished,
            pause_after_push: data.checkpoint.is_some(),
            cookie: self.cookie,
        });

        if let Some(checkpoint) = data.checkpoint {
            let input_channel = self
                .input_channels
                .get_mut(&channel_id)
                .expect("checked above");
            if input_channel.checkpointing_mode == CheckpointingMode::Disabled {
                return Err(ComputeError::CheckpointingDisabled(channel_id));
            }
            let checkpoints = self
                .checkpoints
                .as_mut()
                .ok_or(ComputeError::NoCheckpointCoordinator)?;
            input_channel.pending_checkpoint = Some(checkpoint);
            checkpoints.register_checkpoint(checkpoint, channel_id);
        }

        self.take_input_channel_data_requests.insert(
            self.cookie,
            TakeInputChannelData {
                ack,
                channel_id,
                watermark,
            },
        );
        self.cookie += 1;
        Ok(())
    }

    fn on_input_channel_data_ack(&mut self, cookie: u64, free_space: i64) -> ComputeResult<()> {
        let request = self
            .take_input_channel_data_requests
            .remove(&cookie)
            .ok_or(ComputeError::UnknownCookie(cookie))?;

        if let Some(watermark) = request.watermark {
            if let Some(count) = self.watermark_take_requests.get_mut(&watermark.timestamp_us) {
                *count -= 1;
                if *count == 0 {
                    self.watermark_take_requests.remove(&watermark.timestamp_us);
                }
            }
        }

        let input_channel = self.input_channels.get_mut(&request.channel_id).ok_or(
            ComputeError::UnknownInputChannel {
                task_id: self.task.id,
                channel_id: request.channel_id,
            },
        )?;
        input_channel.free_space = free_space;

        if request.ack {
            self.channels
                .send_channel_data_ack(request.channel_id, free_space);
        }

        self.resume_execution();
        Ok(())
    }

    /// Free space the task runner reported for an input channel; used by
    /// the channel transport to answer upstream acks.
    pub fn input_channel_free_space(&self, channel_id: u64) -> i64 {
        self.input_channels
            .get(&channel_id)
            .map_or(0, |input_channel| input_channel.free_space)
    }

    // === Sources ==========================================================

    fn poll_async_input(&mut self) -> Option<PollResult> {
        let mut new_data = false;
        let mut no_space = false;

        for (index, source) in self.sources.iter_mut() {
            if source.finished || source.push_started {
                continue;
            }
            if source.free_space <= 0 {
                no_space = true;
                continue;
            }
            match source.source.poll(source.free_space) {
                SourcePoll::Data {
                    batch,
                    space,
                    finished,
                } => {
                    source.push_started = true;
                    source.finished = finished;
                    self.process_sources_state.inflight += 1;
                    let _ = self.runner_tx.send(TaskRunnerRequest::SourceData {
                        index: *index,
                        batch,
                        space,
                        finished,
                    });
                    new_data = true;
                }
                SourcePoll::NoSpace => no_space = true,
                SourcePoll::Pending => {}
            }
        }

        if new_data {
            Some(PollResult::NewData)
        } else if no_space {
            Some(PollResult::NoSpace)
        } else {
            None
        }
    }

    fn on_source_data_ack(&mut self, index: u32, free_space_left: i64) -> ComputeResult<()> {
        let source = self
            .sources
            .get_mut(&index)
            .ok_or(ComputeError::UnknownSource(index))?;
        source.push_started = false;
        source.free_space = free_space_left;
        self.process_sources_state.inflight -= 1;
        if self.process_sources_state.inflight == 0 {
            let checkpoint_request = self.get_checkpoint_request();
            self.ask_continue_run(checkpoint_request, false);
        }
        Ok(())
    }

    // === Running ==========================================================

    fn continue_execute(&mut self) {
        let _ = self.self_tx.send(ComputeEvent::ResumeExecution);
    }

    fn resume_execution(&mut self) {
        self.continue_execute();
    }

    fn do_execute(&mut self) {
        self.last_poll_result = self.poll_async_input();

        if self.last_poll_result == Some(PollResult::NewData) {
            // When some source buffer had room and was polled successfully,
            // run again immediately. When the only reason for continuing was
            // lack of space on every source buffer, wait for the current run
            // to complete instead of busy-polling.
            self.continue_execute();
        }

        if self.process_sources_state.inflight == 0 {
            let checkpoint_request = self.get_checkpoint_request();
            self.ask_continue_run(checkpoint_request, false);
        }
    }

    fn get_watermark_request(&mut self) -> Option<Watermark> {
        let pending = self.watermarks.pending_watermark()?;
        if self
            .watermark_take_requests
            .contains_key(&pending.timestamp_us)
        {
            // Not all input-channel pushes preceding the watermark have been
            // injected yet.
            return None;
        }
        Some(pending)
    }

    fn get_checkpoint_request(&mut self) -> Option<Checkpoint> {
        let checkpoints = self.checkpoints.as_ref()?;
        if !self.checkpoint_requested_from_task_runner
            && checkpoints.has_pending_checkpoint()
            && !checkpoints.compute_actor_state_saved()
        {
            self.checkpoint_requested_from_task_runner = true;
            return checkpoints.pending_checkpoint();
        }
        None
    }

    fn ask_continue_run(&mut self, checkpoint_request: Option<Checkpoint>, checkpoint_only: bool) {
        if self.continue_run_event.is_none() {
            self.continue_run_start_wait = Some(Instant::now());
            self.continue_run_event = Some(ContinueRun {
                sink_ids: self.sinks.keys().copied().collect_vec(),
                input_transform_ids: Vec::new(),
                ..Default::default()
            });
        }

        if let Some(watermark) = self.get_watermark_request() {
            let channel_ids = self.output_channels.keys().copied().collect_vec();
            let event = self.continue_run_event.as_mut().expect("created above");
            if let Some(request) = event.watermark_request.as_mut() {
                request.watermark = request.watermark.max(watermark);
            } else {
                event.watermark_request = Some(WatermarkRequest {
                    watermark,
                    channel_ids,
                });
            }
        }

        let output_channel_ids = self.output_channels.keys().copied().collect_vec();
        let sink_ids = self.sinks.keys().copied().collect_vec();
        let event = self.continue_run_event.as_mut().expect("created above");
        event.checkpoint_only = checkpoint_only;

        if let Some(checkpoint) = checkpoint_request {
            if let Some(request) = &event.checkpoint_request {
                assert_eq!(request.checkpoint, checkpoint, "conflicting checkpoint requests");
            } else {
                event.checkpoint_request = Some(CheckpointRequest {
                    channel_ids: output_channel_ids,
                    sink_ids,
                    checkpoint,
                });
            }
        }

        self.process_continue_run();
    }

    fn process_continue_run(&mut self) {
        if self.continue_run_event.is_some()
            && self.cpu_time_quota_asked.is_none()
            && !self.continue_run_inflight
        {
            let event = self.continue_run_event.take().expect("checked above");
            let _ = self.runner_tx.send(TaskRunnerRequest::ContinueRun(event));
            if let Some(started) = self.continue_run_start_wait.take() {
                self.metrics
                    .cpu_quota_wait_delay_ms
                    .observe(started.elapsed().as_secs_f64() * 1000.0);
            }
            self.continue_run_inflight = true;
        }
    }

    fn on_run_finished(&mut self, run: RunFinished) -> ComputeResult<()> {
        self.continue_run_inflight = false;
        if run.mkql_memory_limit > 0 {
            self.mkql_memory_limit = run.mkql_memory_limit;
        }

        tracing::trace!(
            status = ?run.status,
            checkpoint = run.program_state.is_some(),
            watermark_injected = run.watermark_injected_to_outputs,
            "resume execution"
        );

        for (channel_id, free_space) in &run.input_channel_free_space {
            if let Some(input_channel) = self.input_channels.get_mut(channel_id) {
                input_channel.free_space = *free_space;
            }
        }
        for (index, free_space) in &run.sources_free_space {
            if let Some(source) = self.sources.get_mut(index) {
                source.free_space = *free_space;
            }
        }

        if run.watermark_injected_to_outputs {
            if !self.watermarks.has_output_channels() {
                if let Some(pending) = self.watermarks.pending_watermark() {
                    self.resume_inputs_by_watermark(pending);
                    self.watermarks.pop_pending_watermark();
                }
            } else {
                self.watermarks.notify_watermark_injected();
            }
        }

        if run.checkpoint_requested_from_task_runner {
            self.checkpoint_requested_from_task_runner = false;
        }
        if let Some(program_state) = run.program_state {
            self.program_state = Some(program_state);
            self.do_checkpoint()?;
        }

        self.process_outputs(run.status);

        if self.use_cpu_quota() {
            let delta = self.take_cpu_time_delta();
            self.cpu_time_spent += delta;
            self.ask_cpu_quota();
            self.process_continue_run();
        }
        Ok(())
    }

    // === Outputs ==========================================================

    fn process_outputs(&mut self, status: Option<RunStatus>) {
        self.process_outputs_state.last_run_status = status;
        self.process_outputs_state.has_data_to_send = false;
        self.process_outputs_state.all_outputs_finished = true;

        let channel_ids = self.output_channels.keys().copied().collect_vec();
        for channel_id in channel_ids {
            self.drain_output_channel(channel_id);
        }
        let sink_ids = self.sinks.keys().copied().collect_vec();
        for index in sink_ids {
            self.drain_async_output(index);
        }

        self.check_run_status();
    }

    fn drain_output_channel(&mut self, channel_id: u64) {
        let output_channel = self
            .output_channels
            .get_mut(&channel_id)
            .expect("drained channels exist");
        if output_channel.finished && self.checkpoints.is_none() {
            return;
        }
        if output_channel.pop_started {
            return;
        }

        let was_finished = output_channel.finished;
        let should_skip_data = self.channels.should_skip_data(channel_id);
        let has_free_memory = self.channels.has_free_memory(channel_id);

        tracing::trace!(
            channel = channel_id,
            should_skip_data,
            has_free_memory,
            "about to drain channel"
        );

        if !should_skip_data && !output_channel.early_finish && !has_free_memory {
            self.process_outputs_state.has_data_to_send |= !output_channel.finished;
            self.process_outputs_state.all_outputs_finished &= output_channel.finished;
            return;
        }

        output_channel.pop_started = true;
        self.process_outputs_state.inflight += 1;
        let peer_free_memory = self.channels.peer_free_memory(channel_id);
        let _ = self
            .runner_tx
            .send(TaskRunnerRequest::OutputChannelDataRequest {
                channel_id,
                was_finished,
                peer_free_memory,
            });
    }

    fn on_output_channel_data(&mut self, data: OutputChannelData) -> ComputeResult<()> {
        let channel_id = data.channel_id;
        let output_channel = self.output_channels.get_mut(&channel_id).ok_or(
            ComputeError::UnknownOutputChannel {
                task_id: self.task.id,
                channel_id,
            },
        )?;

        // The retry state could have changed since the pop was requested.
        if !self.channels.should_skip_data(channel_id)
            && !self.channels.can_send_channel_data(channel_id)
        {
            output_channel.pop_started = false;
            self.process_outputs_state.inflight -= 1;
            return Ok(());
        }

        if output_channel.async_data.is_some() {
            return Err(ComputeError::OutputDataPending(channel_id));
        }

        output_channel.async_data = Some(AsyncData {
            data: data.data,
            watermark: data.watermark,
            checkpoint: data.checkpoint,
            finished: data.finished,
            changed: data.changed,
        });

        self.send_async_channel_data(channel_id);
        self.check_run_status();
        Ok(())
    }

    fn send_async_channel_data(&mut self, channel_id: u64) {
        // If the channel has finished early, data received after the drain
        // is dropped without error.
        let should_skip_data = self.channels.should_skip_data(channel_id);

        let output_channel = self
            .output_channels
            .get_mut(&channel_id)
            .expect("channel exists");
        let mut async_data = output_channel
            .async_data
            .take()
            .expect("async data was just stored");

        output_channel.finished =
            async_data.finished || should_skip_data || output_channel.early_finish;
        if output_channel.finished {
            self.finished_output_channels.insert(channel_id);
        }

        output_channel.pop_started = false;
        self.process_outputs_state.inflight -= 1;
        self.process_outputs_state.has_data_to_send |= !output_channel.finished;
        self.process_outputs_state.last_pop_returned_no_data = async_data.data.is_empty();

        if let Some(watermark) = async_data.watermark {
            let should_resume_inputs = self
                .watermarks
                .notify_output_channel_watermark_sent(channel_id, watermark);
            if should_resume_inputs {
                self.resume_inputs_by_watermark(watermark);
                self.watermarks.pop_pending_watermark();
            }
        }

        if !should_skip_data {
            if async_data.checkpoint.is_some() {
                self.resume_inputs_by_checkpoint();
            }

            let chunk_count = async_data.data.len();
            for (i, chunk) in async_data.data.drain(..).enumerate() {
                let last_chunk = i + 1 == chunk_count;
                let mut channel_data = ChannelData {
                    channel_id,
                    data: Some(chunk),
                    finished: async_data.finished && last_chunk,
                    checkpoint: None,
                    watermark: None,
                };
                // The watermark and checkpoint ride on the last sub-chunk.
                if last_chunk {
                    channel_data.watermark = async_data.watermark;
                    channel_data.checkpoint = async_data.checkpoint;
                }
                self.channels.send_channel_data(channel_data, last_chunk);
            }
            if chunk_count == 0 && async_data.changed {
                let channel_data = ChannelData {
                    channel_id,
                    data: None,
                    finished: async_data.finished,
                    checkpoint: async_data.checkpoint,
                    watermark: async_data.watermark,
                };
                self.channels.send_channel_data(channel_data, true);
            }
        }

        self.process_outputs_state.data_was_sent |= async_data.changed;
        self.process_outputs_state.all_outputs_finished = self.all_outputs_finished();
    }

    fn all_outputs_finished(&self) -> bool {
        self.finished_output_channels.len() == self.output_channels.len()
            && self.finished_sinks.len() == self.sinks.len()
    }

    fn peer_finished(&mut self, channel_id: u64) -> ComputeResult<()> {
        tracing::info!(channel = channel_id, "peer finished");
        let output_channel = self.output_channels.get_mut(&channel_id).ok_or(
            ComputeError::UnknownOutputChannel {
                task_id: self.task.id,
                channel_id,
            },
        )?;
        output_channel.finished = true;
        output_channel.early_finish = true;

        if output_channel.pop_started {
            // There may be another in-flight pop for this channel.
            return Ok(());
        }

        output_channel.pop_started = true;
        self.process_outputs_state.inflight += 1;
        let _ = self
            .runner_tx
            .send(TaskRunnerRequest::OutputChannelDataRequest {
                channel_id,
                was_finished: true,
                peer_free_memory: 0,
            });
        self.do_execute();
        Ok(())
    }

    // === Sinks ============================================================

    fn drain_async_output(&mut self, index: u32) {
        let sink = self.sinks.get_mut(&index).expect("drained sinks exist");
        if sink.finished && self.checkpoints.is_none() {
            return;
        }
        if sink.pop_started {
            return;
        }

        let allowed_overcommit = self.settings.allowed_channels_overcommit;
        let free_space_before_send = sink.sink.free_space();
        let to_send = free_space_before_send + allowed_overcommit;

        tracing::trace!(
            sink = index,
            free_space = free_space_before_send,
            allowed_overcommit,
            to_send,
            "about to drain sink"
        );

        sink.pop_started = true;
        sink.free_space_before_send = free_space_before_send;
        self.process_outputs_state.inflight += 1;
        let _ = self.runner_tx.send(TaskRunnerRequest::SinkDataRequest {
            index,
            free_space: to_send,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn on_sink_data(
        &mut self,
        index: u32,
        batch: Option<SerializedBatch>,
        data_size: i64,
        checkpoint_size: i64,
        checkpoint: Option<Checkpoint>,
        finished: bool,
        changed: bool,
    ) -> ComputeResult<()> {
        let sink = self
            .sinks
            .get_mut(&index)
            .ok_or(ComputeError::UnknownSink(index))?;

        sink.finished = finished;
        if finished {
            self.finished_sinks.insert(index);
        }
        if checkpoint.is_some() {
            tracing::info!(sink = index, "resume inputs");
            self.resume_inputs_by_checkpoint();
        }

        let sink = self.sinks.get_mut(&index).expect("checked above");
        sink.pop_started = false;
        self.process_outputs_state.inflight -= 1;
        self.process_outputs_state.has_data_to_send |= !sink.finished;

        sink.sink.send_data(batch, data_size, checkpoint, finished);
        tracing::trace!(
            sink = index,
            data_size,
            checkpoint_size,
            free_space_decreased = sink.free_space_before_send - sink.sink.free_space(),
            "sent data and checkpoint barrier to sink"
        );

        self.process_outputs_state.data_was_sent |= finished || changed;
        self.process_outputs_state.all_outputs_finished = self.all_outputs_finished();
        self.check_run_status();
        Ok(())
    }

    // === Watermarks & checkpoints =========================================

    fn resume_inputs_by_watermark(&mut self, watermark: Watermark) {
        for input_channel in self.input_channels.values_mut() {
            if input_channel.watermarks_mode == WatermarksMode::Disabled {
                continue;
            }
            while let Some(front) = input_channel.pending_watermarks.front() {
                if *front <= watermark {
                    input_channel.pending_watermarks.pop_front();
                } else {
                    break;
                }
            }
        }
        self.resume_execution();
    }

    fn resume_inputs_by_checkpoint(&mut self) {
        if let Some(checkpoints) = &mut self.checkpoints {
            let paused = checkpoints.complete_pending();
            for channel_id in paused {
                if let Some(input_channel) = self.input_channels.get_mut(&channel_id) {
                    input_channel.pending_checkpoint = None;
                }
            }
        }
        self.resume_execution();
    }

    /// Copies the runner's program state into the outgoing snapshot and asks
    /// every source to save alongside.
    fn do_checkpoint(&mut self) -> ComputeResult<()> {
        let program_state = self
            .program_state
            .take()
            .ok_or(ComputeError::MissingProgramState)?;
        let checkpoints = self
            .checkpoints
            .as_mut()
            .ok_or(ComputeError::NoCheckpointCoordinator)?;
        let checkpoint = checkpoints
            .pending_checkpoint()
            .ok_or(ComputeError::NoPendingCheckpoint)?;

        let mut state = ComputeActorCheckpointState {
            program_state,
            sources: Vec::new(),
        };
        for (input_index, source) in self.sources.iter_mut() {
            state.sources.push(SourceState {
                input_index: *input_index,
                state: source.source.save_state(&checkpoint),
            });
        }
        checkpoints.do_checkpoint(state);
        Ok(())
    }

    // === CPU quota ========================================================

    fn use_cpu_quota(&self) -> bool {
        self.quota_tx.is_some()
            && !self.task.rate_limiter.is_empty()
            && !self.task.rate_limiter_resource.is_empty()
    }

    fn take_cpu_time_delta(&mut self) -> Duration {
        let delta = self.total_cpu_time - self.last_accounted_cpu_time;
        self.last_accounted_cpu_time = self.total_cpu_time;
        delta
    }

    fn ask_cpu_quota(&mut self) {
        assert!(self.cpu_time_quota_asked.is_none());
        if self.cpu_time_spent >= self.settings.min_quoted_cpu_time {
            let amount_ms = self.cpu_time_spent.as_millis() as u64;
            tracing::trace!(amount_ms, "ask CPU quota");
            self.metrics.cpu_time_spent_ms.inc_by(amount_ms);
            if let Some(quota_tx) = &self.quota_tx {
                let _ = quota_tx.send(QuotaRequest {
                    rate_limiter: self.task.rate_limiter.clone(),
                    resource: self.task.rate_limiter_resource.clone(),
                    amount_ms,
                    final_flush: false,
                });
            }
            self.cpu_time_quota_asked = Some(Instant::now());
            self.cpu_time_spent = Duration::ZERO;
        }
    }

    fn on_cpu_quota_given(&mut self, success: bool) {
        if let Some(asked) = self.cpu_time_quota_asked.take() {
            let delay_ms = asked.elapsed().as_secs_f64() * 1000.0;
            tracing::trace!(delay_ms, "CPU quota delay");
            self.metrics.cpu_quota_latency_ms.observe(delay_ms);
        }

        if !success {
            self.internal_error(ComputeError::QuotaDenied);
            return;
        }

        self.process_continue_run();
    }

    // === Completion & state ===============================================

    fn check_run_status(&mut self) {
        if !self.take_input_channel_data_requests.is_empty() {
            tracing::trace!(
                pending = self.take_input_channel_data_requests.len(),
                has_data_to_send = self.process_outputs_state.has_data_to_send,
                last_pop_returned_no_data = self.process_outputs_state.last_pop_returned_no_data,
                "input pushes still in flight"
            );
            return;
        }
        if self.process_outputs_state.last_run_status == Some(RunStatus::PendingInput)
            && self.last_poll_result.is_some()
        {
            self.continue_execute();
        }
        if self.process_outputs_state.inflight != 0 {
            return;
        }

        match self.process_outputs_state.last_run_status {
            Some(RunStatus::Finished) => {
                if self.all_outputs_finished() {
                    self.report_state(ComputeState::Finished, StatusIds::Success, Vec::new());
                    self.terminated = true;
                }
            }
            Some(RunStatus::PendingOutput) => {
                if self.process_outputs_state.data_was_sent {
                    self.continue_execute();
                }
            }
            _ => {}
        }
    }

    fn on_state_request(&mut self) {
        let state = ComputeActorState {
            state: ComputeState::Executing as i32,
            status_code: StatusIds::Success as i32,
            task_id: self.task.id,
            issues: Vec::new(),
            mkql_memory_limit: self.mkql_memory_limit,
        };
        let _ = self.executer_tx.send(ComputeNotice::State(state));
    }

    fn report_state(&mut self, state: ComputeState, status: StatusIds, issues: Vec<IssueProto>) {
        let state = ComputeActorState {
            state: state as i32,
            status_code: status as i32,
            task_id: self.task.id,
            issues,
            mkql_memory_limit: self.mkql_memory_limit,
        };
        let _ = self.executer_tx.send(ComputeNotice::State(state));
    }

    fn internal_error(&mut self, error: ComputeError) {
        tracing::error!(task = self.task.id, error = %error, "internal error");
        let issue = IssueProto {
            message: error.to_string(),
            severity: 0,
            issues: Vec::new(),
        };
        self.report_state(ComputeState::Failure, error.status(), vec![issue]);
        self.terminated = true;
    }

    /// Flushes outstanding CPU-quota debt with one best-effort message, then
    /// de-registers.
    fn pass_away(&mut self) {
        if self.use_cpu_quota() && !self.cpu_time_spent.is_zero() {
            let amount_ms = self.cpu_time_spent.as_millis() as u64;
            self.metrics.cpu_time_spent_ms.inc_by(amount_ms);
            if let Some(quota_tx) = &self.quota_tx {
                let _ = quota_tx.send(QuotaRequest {
                    rate_limiter: self.task.rate_limiter.clone(),
                    resource: self.task.rate_limiter_resource.clone(),
                    amount_ms,
                    final_flush: true,
                });
            }
        }
        tracing::debug!(task = self.task.id, "compute actor passed away");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopTracker;

    impl ChannelTracker for NoopTracker {
        fn should_skip_data(&self, _channel_id: u64) -> bool {
            false
        }

        fn has_free_memory(&self, _channel_id: u64) -> bool {
            true
        }

        fn can_send_channel_data(&self, _channel_id: u64) -> bool {
            true
        }

        fn peer_free_memory(&self, _channel_id: u64) -> i64 {
            1 << 20
        }

        fn send_channel_data(&mut self, _data: ChannelData, _need_flush: bool) {}

        fn send_channel_data_ack(&mut self, _channel_id: u64, _free_space: i64) {}
    }

    fn two_input_task() -> TaskDesc {
        use tidewave_pb::task::{ChannelDesc, TaskInputDesc, TaskOutputDesc, UnionAllInput};

        TaskDesc {
            id: 1,
            inputs: vec![
                TaskInputDesc {
                    r#type: Some(task_input_desc::Type::UnionAll(UnionAllInput::default())),
                    channels: vec![ChannelDesc {
                        id: 100,
                        ..Default::default()
                    }],
                    transform: None,
                },
                TaskInputDesc {
                    r#type: Some(task_input_desc::Type::UnionAll(UnionAllInput::default())),
                    channels: vec![ChannelDesc {
                        id: 101,
                        ..Default::default()
                    }],
                    transform: None,
                },
            ],
            outputs: vec![TaskOutputDesc {
                r#type: Some(task_output_desc::Type::Map(Default::default())),
                channels: vec![ChannelDesc {
                    id: 200,
                    ..Default::default()
                }],
            }],
            ..Default::default()
        }
    }

    fn make_actor(task: TaskDesc, settings: ComputeActorSettings) -> (
        AsyncComputeActor,
        mpsc::UnboundedReceiver<TaskRunnerRequest>,
        mpsc::UnboundedReceiver<ComputeNotice>,
    ) {
        let (runner_tx, runner_rx) = mpsc::unbounded_channel();
        let (executer_tx, executer_rx) = mpsc::unbounded_channel();
        let (actor, _inbox) = AsyncComputeActor::new(
            task,
            settings,
            runner_tx,
            Box::new(NoopTracker),
            executer_tx,
            None,
            None,
            BTreeMap::new(),
            BTreeMap::new(),
            ComputeActorMetrics::for_test(),
        );
        (actor, runner_rx, executer_rx)
    }

    fn batch(rows: u32) -> SerializedBatch {
        SerializedBatch {
            rows,
            raw: vec![0; rows as usize],
        }
    }

    /// Watermark barrier: the pending watermark is not offered to the task
    /// runner until every input channel reached it and all pushes preceding
    /// it have been acknowledged.
    #[test]
    fn test_watermark_barrier() {
        let settings = ComputeActorSettings {
            watermarks_mode: WatermarksMode::Default,
            ..Default::default()
        };
        let (mut actor, mut runner_rx, _notices) = make_actor(two_input_task(), settings);

        // Channel A delivers a batch at t=5 and a watermark t=10.
        actor
            .take_input_channel_data(
                ChannelData {
                    channel_id: 100,
                    data: Some(batch(1)),
                    finished: false,
                    checkpoint: None,
                    watermark: Some(Watermark::new(10)),
                },
                false,
            )
            .unwrap();
        // Channel B delivers only a batch at t=7, no watermark.
        actor
            .take_input_channel_data(
                ChannelData {
                    channel_id: 101,
                    data: Some(batch(1)),
                    finished: false,
                    checkpoint: None,
                    watermark: None,
                },
                false,
            )
            .unwrap();

        // Channel A is paused at 10; channel B is not paused.
        assert!(actor.input_channels[&100].is_paused());
        assert_eq!(
            actor.input_channels[&100].pending_watermarks,
            vec![Watermark::new(10)]
        );
        assert!(!actor.input_channels[&101].is_paused());

        // Both pushes acknowledged; the watermark still must not be offered,
        // because channel B has not reached t=10.
        actor.on_input_channel_data_ack(0, 100).unwrap();
        actor.on_input_channel_data_ack(1, 100).unwrap();
        assert_eq!(actor.input_channel_free_space(100), 100);
        actor.do_execute();

        let mut saw_continue_run = false;
        while let Ok(request) = runner_rx.try_recv() {
            if let TaskRunnerRequest::ContinueRun(run) = request {
                saw_continue_run = true;
                assert!(run.watermark_request.is_none());
            }
        }
        assert!(saw_continue_run);
    }

    /// A watermark whose preceding pushes are still unacknowledged is
    /// withheld even when every channel has reached it.
    #[test]
    fn test_watermark_withheld_until_pushes_acked() {
        let settings = ComputeActorSettings {
            watermarks_mode: WatermarksMode::Default,
            ..Default::default()
        };
        let (mut actor, mut runner_rx, _notices) = make_actor(two_input_task(), settings);

        for channel_id in [100u64, 101] {
            actor
                .take_input_channel_data(
                    ChannelData {
                        channel_id,
                        data: Some(batch(1)),
                        finished: false,
                        checkpoint: None,
                        watermark: Some(Watermark::new(10)),
                    },
                    false,
                )
                .unwrap();
        }

        // Watermark is pending, but pushes are unacknowledged.
        assert!(actor.watermarks.has_pending_watermark());
        assert!(actor.get_watermark_request().is_none());

        actor.on_input_channel_data_ack(0, 100).unwrap();
        actor.on_input_channel_data_ack(1, 100).unwrap();
        assert_eq!(actor.get_watermark_request(), Some(Watermark::new(10)));

        actor.do_execute();
        let mut watermark_request = None;
        while let Ok(request) = runner_rx.try_recv() {
            if let TaskRunnerRequest::ContinueRun(run) = request {
                watermark_request = run.watermark_request;
            }
        }
        let watermark_request = watermark_request.expect("watermark offered to task runner");
        assert_eq!(watermark_request.watermark, Watermark::new(10));
        assert_eq!(watermark_request.channel_ids, vec![200]);
    }

    /// Out-of-order output data while async data is still pending is an
    /// internal error.
    #[test]
    fn test_out_of_order_output_channel_data() {
        let (mut actor, _runner_rx, _notices) = make_actor(two_input_task(), Default::default());

        actor
            .output_channels
            .get_mut(&200)
            .unwrap()
            .async_data = Some(AsyncData::default());
        actor.process_outputs_state.inflight = 1;

        let err = actor
            .on_output_channel_data(OutputChannelData {
                channel_id: 200,
                data: vec![batch(1)],
                ..Default::default()
            })
            .unwrap_err();
        assert!(
            matches!(err, ComputeError::OutputDataPending(200)),
            "got: {err}"
        );
    }

    /// The task terminates only when finished output channels plus finished
    /// sinks cover every endpoint.
    #[test]
    fn test_finish_covers_all_endpoints() {
        let (mut actor, _runner_rx, mut notices) = make_actor(two_input_task(), Default::default());

        actor.process_outputs_state.last_run_status = Some(RunStatus::Finished);
        actor.check_run_status();
        assert!(!actor.terminated);

        actor.finished_output_channels.insert(200);
        actor.check_run_status();
        assert!(actor.terminated);

        let notice = notices.try_recv().unwrap();
        let ComputeNotice::State(state) = notice;
        assert_eq!(state.state, ComputeState::Finished as i32);
        assert_eq!(state.status_code, StatusIds::Success as i32);
    }
}
