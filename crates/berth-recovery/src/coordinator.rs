//! RecoveryCoordinator — retry / fallback / abort decisions.

use std::time::Duration;

use berth_core::RecoveryConfig;
use berth_state::{ErrorKind, Stage};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backoff::backoff_delay;
use crate::classify::{ClassifiedError, Failure, classify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Fallback,
    Abort,
}

/// Where in the pipeline a failure happened and how often it was retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryContext {
    pub stage: Stage,
    /// Retries already spent on this stage.
    pub retry_count: u32,
    pub max_retries: u32,
    /// Whether the smaller-profile fallback was already tried.
    pub fallback_used: bool,
}

impl RecoveryContext {
    pub fn new(stage: Stage, max_retries: u32) -> Self {
        Self {
            stage,
            retry_count: 0,
            max_retries,
            fallback_used: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryDecision {
    /// Whether the pipeline may continue (retry or fallback).
    pub recovered: bool,
    pub action: RecoveryAction,
    pub next_retry_in: Option<Duration>,
    pub error: ClassifiedError,
}

impl RecoveryDecision {
    fn abort(error: ClassifiedError) -> Self {
        Self {
            recovered: false,
            action: RecoveryAction::Abort,
            next_retry_in: None,
            error,
        }
    }
}

pub struct RecoveryCoordinator {
    config: RecoveryConfig,
}

impl RecoveryCoordinator {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    pub fn context(&self, stage: Stage) -> RecoveryContext {
        RecoveryContext::new(stage, self.config.max_retries)
    }

    /// Classify `failure` and decide what the pipeline does next.
    pub fn handle_error(
        &self,
        deployment_id: &str,
        failure: &Failure,
        ctx: &RecoveryContext,
    ) -> RecoveryDecision {
        let error = classify(failure, ctx.stage);
        let decision = self.decide(error, ctx);

        match decision.action {
            RecoveryAction::Abort => warn!(
                %deployment_id,
                stage = %ctx.stage,
                kind = %decision.error.kind,
                retry_count = ctx.retry_count,
                error = %decision.error.message,
                "aborting deployment"
            ),
            action => info!(
                %deployment_id,
                stage = %ctx.stage,
                kind = %decision.error.kind,
                ?action,
                retry_count = ctx.retry_count,
                delay_ms = decision.next_retry_in.map(|d| d.as_millis() as u64),
                "recovering from failure"
            ),
        }
        decision
    }

    fn decide(&self, error: ClassifiedError, ctx: &RecoveryContext) -> RecoveryDecision {
        if !error.recoverable || ctx.retry_count >= ctx.max_retries {
            return RecoveryDecision::abort(error);
        }
        match error.kind {
            ErrorKind::Timeout | ErrorKind::Network => RecoveryDecision {
                recovered: true,
                action: RecoveryAction::Retry,
                next_retry_in: Some(backoff_delay(error.kind, ctx.retry_count, &self.config)),
                error,
            },
            ErrorKind::Resource if ctx.stage == Stage::Provisioning && !ctx.fallback_used => {
                RecoveryDecision {
                    recovered: true,
                    action: RecoveryAction::Fallback,
                    next_retry_in: None,
                    error,
                }
            }
            _ => RecoveryDecision::abort(error),
        }
    }
}
