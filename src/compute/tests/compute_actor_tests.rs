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

//! End-to-end compute actor flows with a scripted task runner.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tidewave_compute::{
    AsyncComputeActor, ChannelTracker, CheckpointEvent, ComputeActorMetrics,
    ComputeActorSettings, ComputeEvent, ComputeNotice, OutputChannelData, QuotaRequest,
    RunFinished, RunStatus, TaskRunnerEvent, TaskRunnerRequest,
};
use tidewave_pb::data::{
    ChannelData, Checkpoint, CheckpointingMode, ComputeState, SerializedBatch, StatusIds,
};
use tidewave_pb::task::{
    task_input_desc, task_output_desc, ChannelDesc, TaskDesc, TaskInputDesc, TaskOutputDesc,
    UnionAllInput,
};
use tokio::sync::mpsc;

#[derive(Clone, Default)]
struct RecordingTracker {
    skip: Arc<Mutex<Vec<u64>>>,
    sent: Arc<Mutex<Vec<ChannelData>>>,
    acks: Arc<Mutex<Vec<(u64, i64)>>>,
}

impl RecordingTracker {
    fn sent_data(&self) -> Vec<ChannelData> {
        self.sent.lock().clone()
    }

    fn mark_skipping(&self, channel_id: u64) {
        self.skip.lock().push(channel_id);
    }
}

impl ChannelTracker for RecordingTracker {
    fn should_skip_data(&self, channel_id: u64) -> bool {
        self.skip.lock().contains(&channel_id)
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

    fn send_channel_data(&mut self, data: ChannelData, _need_flush: bool) {
        self.sent.lock().push(data);
    }

    fn send_channel_data_ack(&mut self, channel_id: u64, free_space: i64) {
        self.acks.lock().push((channel_id, free_space));
    }
}

fn one_in_one_out_task(rate_limiter: Option<(&str, &str)>) -> TaskDesc {
    let mut task = TaskDesc {
        id: 42,
        inputs: vec![TaskInputDesc {
            r#type: Some(task_input_desc::Type::UnionAll(UnionAllInput::default())),
            channels: vec![ChannelDesc {
                id: 10,
                ..Default::default()
            }],
            transform: None,
        }],
        outputs: vec![TaskOutputDesc {
            r#type: Some(task_output_desc::Type::Map(Default::default())),
            channels: vec![ChannelDesc {
                id: 20,
                ..Default::default()
            }],
        }],
        ..Default::default()
    };
    if let Some((rate_limiter, resource)) = rate_limiter {
        task.rate_limiter = rate_limiter.to_owned();
        task.rate_limiter_resource = resource.to_owned();
    }
    task
}

struct Harness {
    events: mpsc::UnboundedSender<ComputeEvent>,
    runner_rx: mpsc::UnboundedReceiver<TaskRunnerRequest>,
    notices: mpsc::UnboundedReceiver<ComputeNotice>,
    quota_rx: Option<mpsc::UnboundedReceiver<QuotaRequest>>,
    checkpoints_rx: Option<mpsc::UnboundedReceiver<CheckpointEvent>>,
    tracker: RecordingTracker,
}

fn spawn_actor(
    task: TaskDesc,
    settings: ComputeActorSettings,
    with_quota: bool,
    with_checkpoints: bool,
) -> Harness {
    let (runner_tx, runner_rx) = mpsc::unbounded_channel();
    let (executer_tx, notices) = mpsc::unbounded_channel();
    let (quota_tx, quota_rx) = if with_quota {
        let (tx, rx) = mpsc::unbounded_channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let (checkpoint_tx, checkpoints_rx) = if with_checkpoints {
        let (tx, rx) = mpsc::unbounded_channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let tracker = RecordingTracker::default();

    let (actor, events) = AsyncComputeActor::new(
        task,
        settings,
        runner_tx,
        Box::new(tracker.clone()),
        executer_tx,
        checkpoint_tx,
        quota_tx,
        BTreeMap::new(),
        BTreeMap::new(),
        ComputeActorMetrics::for_test(),
    );
    tokio::spawn(actor.run());

    Harness {
        events,
        runner_rx,
        notices,
        quota_rx,
        checkpoints_rx,
        tracker,
    }
}

async fn recv_runner(harness: &mut Harness) -> TaskRunnerRequest {
    tokio::time::timeout(Duration::from_secs(5), harness.runner_rx.recv())
        .await
        .expect("task runner request expected")
        .expect("runner channel open")
}

async fn expect_continue_run(harness: &mut Harness) -> tidewave_compute::ContinueRun {
    loop {
        if let TaskRunnerRequest::ContinueRun(run) = recv_runner(harness).await {
            return run;
        }
    }
}

async fn expect_input_push(harness: &mut Harness) -> u64 {
    loop {
        if let TaskRunnerRequest::InputChannelData { cookie, .. } = recv_runner(harness).await {
            return cookie;
        }
    }
}

async fn expect_hello(harness: &mut Harness) {
    let notice = tokio::time::timeout(Duration::from_secs(5), harness.notices.recv())
        .await
        .unwrap()
        .unwrap();
    let ComputeNotice::State(state) = notice;
    assert_eq!(state.state, ComputeState::Executing as i32);
}

fn batch(rows: u32) -> SerializedBatch {
    SerializedBatch {
        rows,
        raw: vec![7; rows as usize],
    }
}

#[tokio::test]
async fn test_task_runs_to_completion() {
    let mut harness = spawn_actor(
        one_in_one_out_task(None),
        ComputeActorSettings::default(),
        false,
        false,
    );
    expect_hello(&mut harness).await;

    // Bootstrap triggers the first run.
    let _run = expect_continue_run(&mut harness).await;

    // The runner finishes; the actor drains the output channel.
    harness
        .events
        .send(ComputeEvent::Runner(TaskRunnerEvent::RunFinished(
            RunFinished {
                status: Some(RunStatus::Finished),
                ..Default::default()
            },
        )))
        .unwrap();

    let pop = recv_runner(&mut harness).await;
    let channel_id = match pop {
        TaskRunnerRequest::OutputChannelDataRequest { channel_id, .. } => channel_id,
        other => panic!("expected output pop, got {:?}", other),
    };
    assert_eq!(channel_id, 20);

    harness
        .events
        .send(ComputeEvent::Runner(TaskRunnerEvent::OutputChannelData(
            OutputChannelData {
                channel_id: 20,
                data: vec![batch(3), batch(2)],
                finished: true,
                changed: true,
                ..Default::default()
            },
        )))
        .unwrap();

    // The last chunk alone carries the finished flag; ordering preserved.
    let notice = tokio::time::timeout(Duration::from_secs(5), harness.notices.recv())
        .await
        .unwrap()
        .unwrap();
    let ComputeNotice::State(state) = notice;
    assert_eq!(state.state, ComputeState::Finished as i32);
    assert_eq!(state.status_code, StatusIds::Success as i32);
    assert_eq!(state.task_id, 42);

    let sent = harness.tracker.sent_data();
    assert_eq!(sent.len(), 2);
    assert!(!sent[0].finished);
    assert!(sent[1].finished);
    assert_eq!(sent[0].data.as_ref().unwrap().rows, 3);
    assert_eq!(sent[1].data.as_ref().unwrap().rows, 2);
}

#[tokio::test]
async fn test_early_finished_peer_drops_data() {
    let mut harness = spawn_actor(
        one_in_one_out_task(None),
        ComputeActorSettings::default(),
        false,
        false,
    );
    expect_hello(&mut harness).await;
    let _run = expect_continue_run(&mut harness).await;

    // The peer goes away; pending data must be drained to drop.
    harness.tracker.mark_skipping(20);
    harness
        .events
        .send(ComputeEvent::PeerFinished { channel_id: 20 })
        .unwrap();

    let pop = recv_runner(&mut harness).await;
    match pop {
        TaskRunnerRequest::OutputChannelDataRequest {
            channel_id,
            was_finished,
            ..
        } => {
            assert_eq!(channel_id, 20);
            assert!(was_finished);
        }
        other => panic!("expected output pop, got {:?}", other),
    }

    harness
        .events
        .send(ComputeEvent::Runner(TaskRunnerEvent::OutputChannelData(
            OutputChannelData {
                channel_id: 20,
                data: vec![batch(9)],
                finished: true,
                changed: true,
                ..Default::default()
            },
        )))
        .unwrap();

    // Finish the program to let the actor terminate cleanly.
    harness
        .events
        .send(ComputeEvent::Runner(TaskRunnerEvent::RunFinished(
            RunFinished {
                status: Some(RunStatus::Finished),
                ..Default::default()
            },
        )))
        .unwrap();

    let notice = tokio::time::timeout(Duration::from_secs(5), harness.notices.recv())
        .await
        .unwrap()
        .unwrap();
    let ComputeNotice::State(state) = notice;
    assert_eq!(state.state, ComputeState::Finished as i32);

    // The dropped batch never reached the channel transport.
    assert!(harness.tracker.sent_data().is_empty());
}

#[tokio::test]
async fn test_cpu_quota_round_trip() {
    let settings = ComputeActorSettings {
        // Any accumulated CPU time is enough to request quota.
        min_quoted_cpu_time: Duration::ZERO,
        ..Default::default()
    };
    let mut harness = spawn_actor(one_in_one_out_task(Some(("r", "cpu"))), settings, true, false);
    expect_hello(&mut harness).await;
    let _run = expect_continue_run(&mut harness).await;

    // Run completes; the actor accounts CPU time and asks for quota.
    harness
        .events
        .send(ComputeEvent::Runner(TaskRunnerEvent::RunFinished(
            RunFinished {
                status: Some(RunStatus::PendingInput),
                ..Default::default()
            },
        )))
        .unwrap();

    let quota_rx = harness.quota_rx.as_mut().unwrap();
    let request = tokio::time::timeout(Duration::from_secs(5), quota_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.rate_limiter, "r");
    assert_eq!(request.resource, "cpu");
    assert!(!request.final_flush);

    // New input wants another run, but ContinueRun is withheld while the
    // quota round-trip is outstanding.
    harness
        .events
        .send(ComputeEvent::ChannelData {
            data: ChannelData {
                channel_id: 10,
                data: Some(batch(1)),
                ..Default::default()
            },
            ack: false,
        })
        .unwrap();
    let cookie = expect_input_push(&mut harness).await;
    harness
        .events
        .send(ComputeEvent::Runner(TaskRunnerEvent::InputChannelDataAck {
            cookie,
            free_space: 100,
        }))
        .unwrap();

    // Nothing else may reach the runner until clearance.
    tokio::time::timeout(Duration::from_millis(100), harness.runner_rx.recv())
        .await
        .expect_err("ContinueRun must be withheld until clearance");

    harness
        .events
        .send(ComputeEvent::QuotaCleared { success: true })
        .unwrap();
    let _run = expect_continue_run(&mut harness).await;
}

#[tokio::test]
async fn test_cpu_quota_denied_is_fatal() {
    let settings = ComputeActorSettings {
        min_quoted_cpu_time: Duration::ZERO,
        ..Default::default()
    };
    let mut harness = spawn_actor(one_in_one_out_task(Some(("r", "cpu"))), settings, true, false);
    expect_hello(&mut harness).await;
    let _run = expect_continue_run(&mut harness).await;

    harness
        .events
        .send(ComputeEvent::Runner(TaskRunnerEvent::RunFinished(
            RunFinished {
                status: Some(RunStatus::PendingInput),
                ..Default::default()
            },
        )))
        .unwrap();
    let _request = harness.quota_rx.as_mut().unwrap().recv().await.unwrap();

    harness
        .events
        .send(ComputeEvent::QuotaCleared { success: false })
        .unwrap();

    let notice = tokio::time::timeout(Duration::from_secs(5), harness.notices.recv())
        .await
        .unwrap()
        .unwrap();
    let ComputeNotice::State(state) = notice;
    assert_eq!(state.state, ComputeState::Failure as i32);
    assert_eq!(state.status_code, StatusIds::InternalError as i32);
    assert_eq!(state.issues[0].message, "Error getting CPU quota");
}

#[tokio::test]
async fn test_checkpoint_state_saved() {
    let settings = ComputeActorSettings {
        checkpointing_mode: CheckpointingMode::Default,
        ..Default::default()
    };
    let mut harness = spawn_actor(one_in_one_out_task(None), settings, false, true);
    expect_hello(&mut harness).await;
    let _run = expect_continue_run(&mut harness).await;
    harness
        .events
        .send(ComputeEvent::Runner(TaskRunnerEvent::RunFinished(
            RunFinished {
                status: Some(RunStatus::PendingInput),
                ..Default::default()
            },
        )))
        .unwrap();

    // A checkpoint barrier arrives on the input channel.
    let checkpoint = Checkpoint::new(1, 5);
    harness
        .events
        .send(ComputeEvent::ChannelData {
            data: ChannelData {
                channel_id: 10,
                data: Some(batch(1)),
                checkpoint: Some(checkpoint),
                ..Default::default()
            },
            ack: false,
        })
        .unwrap();

    let cookie = loop {
        match recv_runner(&mut harness).await {
            TaskRunnerRequest::InputChannelData {
                cookie,
                pause_after_push,
                ..
            } => {
                assert!(pause_after_push);
                break cookie;
            }
            _ => continue,
        }
    };
    harness
        .events
        .send(ComputeEvent::Runner(TaskRunnerEvent::InputChannelDataAck {
            cookie,
            free_space: 100,
        }))
        .unwrap();

    // The next ContinueRun carries the checkpoint request.
    let run = expect_continue_run(&mut harness).await;
    let request = run.checkpoint_request.expect("checkpoint requested");
    assert_eq!(request.checkpoint, checkpoint);
    assert_eq!(request.channel_ids, vec![20]);

    // The runner hands back the program state; the actor ships the snapshot.
    harness
        .events
        .send(ComputeEvent::Runner(TaskRunnerEvent::RunFinished(
            RunFinished {
                status: Some(RunStatus::PendingInput),
                program_state: Some(b"program-state".to_vec()),
                ..Default::default()
            },
        )))
        .unwrap();

    let checkpoints_rx = harness.checkpoints_rx.as_mut().unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), checkpoints_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        CheckpointEvent::StateSaved {
            task_id,
            checkpoint: saved,
            state,
        } => {
            assert_eq!(task_id, 42);
            assert_eq!(saved, checkpoint);
            assert_eq!(state.program_state, b"program-state");
        }
    }
}

#[tokio::test]
async fn test_state_request_snapshot() {
    let mut harness = spawn_actor(
        one_in_one_out_task(None),
        ComputeActorSettings::default(),
        false,
        false,
    );
    expect_hello(&mut harness).await;

    harness.events.send(ComputeEvent::StateRequest).unwrap();
    let notice = tokio::time::timeout(Duration::from_secs(5), harness.notices.recv())
        .await
        .unwrap()
        .unwrap();
    let ComputeNotice::State(state) = notice;
    assert_eq!(state.state, ComputeState::Executing as i32);
    assert_eq!(state.status_code, StatusIds::Success as i32);
    assert_eq!(state.task_id, 42);
    assert!(state.mkql_memory_limit > 0);
}

#[tokio::test]
async fn test_unknown_channel_is_internal_error() {
    let mut harness = spawn_actor(
        one_in_one_out_task(None),
        ComputeActorSettings::default(),
        false,
        false,
    );
    expect_hello(&mut harness).await;

    harness
        .events
        .send(ComputeEvent::ChannelData {
            data: ChannelData {
                channel_id: 999,
                data: Some(batch(1)),
                ..Default::default()
            },
            ack: false,
        })
        .unwrap();

    let notice = tokio::time::timeout(Duration::from_secs(5), harness.notices.recv())
        .await
        .unwrap()
        .unwrap();
    let ComputeNotice::State(state) = notice;
    assert_eq!(state.state, ComputeState::Failure as i32);
    assert_eq!(state.status_code, StatusIds::InternalError as i32);
}
