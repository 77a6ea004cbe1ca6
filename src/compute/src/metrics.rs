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

use std::sync::Arc;

use prometheus::{
    histogram_opts, register_histogram_with_registry, register_int_counter_with_registry,
    Histogram, IntCounter, Registry,
};

/// Per-process compute actor metrics; one instance shared by every actor.
#[derive(Clone)]
pub struct ComputeActorMetrics {
    /// Milliseconds of CPU time accounted to the rate limiter.
    pub cpu_time_spent_ms: IntCounter,
    /// Latency of one CPU-quota round-trip.
    pub cpu_quota_latency_ms: Histogram,
    /// How long `ContinueRun` was withheld waiting for quota.
    pub cpu_quota_wait_delay_ms: Histogram,
}

impl ComputeActorMetrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        let cpu_time_spent_ms = register_int_counter_with_registry!(
            "compute_actor_cpu_time_spent_ms",
            "CPU time accounted to the rate limiter, in milliseconds",
            registry
        )
        .unwrap();
        let cpu_quota_latency_ms = register_histogram_with_registry!(
            histogram_opts!(
                "compute_actor_cpu_quota_latency_ms",
                "Latency of a CPU quota round-trip",
                prometheus::exponential_buckets(1.0, 2.0, 12).unwrap()
            ),
            registry
        )
        .unwrap();
        let cpu_quota_wait_delay_ms = register_histogram_with_registry!(
            histogram_opts!(
                "compute_actor_cpu_quota_wait_delay_ms",
                "Delay of ContinueRun while waiting for CPU quota",
                prometheus::exponential_buckets(1.0, 2.0, 12).unwrap()
            ),
            registry
        )
        .unwrap();

        Arc::new(Self {
            cpu_time_spent_ms,
            cpu_quota_latency_ms,
            cpu_quota_wait_delay_ms,
        })
    }

    pub fn for_test() -> Arc<Self> {
        Self::new(&Registry::new())
    }
}
