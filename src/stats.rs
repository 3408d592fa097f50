// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

macro_rules! metrics {
    ($($name:ident : $type:ty = $make:expr);* $(;)?) => {
        $(
          lazy_static! {
            pub static ref $name: $type = $make.unwrap();
          }
        )*

        pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
          $(registry.register(Box::new($name.clone()))?;)*
          Ok(())
        }
    };
}

metrics! {
    PUSHED: IntCounter =
        IntCounter::new("relyq_pushed_total", "Number of tasks pushed onto todo");

    CLAIMED: IntCounter =
        IntCounter::new("relyq_claimed_total", "Number of tasks claimed from todo into doing");

    FINISHED: IntCounter =
        IntCounter::new("relyq_finished_total", "Number of tasks finished successfully");

    FAILED: IntCounter =
        IntCounter::new("relyq_failed_total", "Number of tasks moved to failed");

    REMOVED: IntCounter =
        IntCounter::new("relyq_removed_total", "Number of tasks explicitly removed");

    ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("relyq_errors_total", "Number of errors by operation"),
        &["op"],
    );

    TODO_DEPTH: IntGauge =
        IntGauge::new("relyq_todo_depth", "Most recently sampled length of todo");

    DOING_DEPTH: IntGauge =
        IntGauge::new("relyq_doing_depth", "Most recently sampled length of doing");
}
