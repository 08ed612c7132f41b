use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::UploadConfig;
use crate::plan::{PlanAction, PlannedUpload};
use crate::resolve::ContentKind;
use crate::session::{SessionClient, WikiApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt, for transient failures only.
    pub max_retries: usize,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            base_delay_ms: crate::config::DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_retries: config.max_retries(),
            base_delay_ms: config.retry_delay_ms(),
        }
    }

    /// Exponential backoff with up to 100ms of jitter. `retry` counts from zero.
    pub fn delay_for(&self, retry: usize) -> Duration {
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = u32::try_from(retry).unwrap_or(16).min(16);
        let base = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        Duration::from_millis(base.saturating_add(jitter))
    }
}

/// Shared stop flag. Set from a signal handler; checked before each new target.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub retry: RetryPolicy,
    pub workers: usize,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub local_path: String,
    pub remote_page_name: String,
    pub content_kind: ContentKind,
    pub status: UploadStatus,
    pub attempts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub success: bool,
    pub ok: usize,
    pub skipped: usize,
    pub failed: usize,
    pub not_attempted: usize,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub relogins: usize,
    pub request_count: usize,
    /// Per-target outcomes in plan order. Targets never started are absent.
    pub results: Vec<UploadResult>,
}

impl UploadReport {
    pub fn failures(&self) -> impl Iterator<Item = &UploadResult> {
        self.results
            .iter()
            .filter(|result| result.status == UploadStatus::Failed)
    }
}

/// Run the plan against the session. Per-target failures never stop the run;
/// cancellation and a failed re-login stop scheduling new targets.
pub fn execute<A: WikiApi>(
    client: &SessionClient<A>,
    planned: Vec<PlannedUpload>,
    options: &ExecuteOptions,
) -> UploadReport {
    let total = planned.len();
    let workers = options.workers.clamp(1, total.max(1));
    let next = AtomicUsize::new(0);
    let aborted: Mutex<Option<String>> = Mutex::new(None);
    let slots: Vec<Mutex<Option<UploadResult>>> = (0..total).map(|_| Mutex::new(None)).collect();

    info!(targets = total, workers, "starting upload");
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if options.cancel.is_cancelled() || is_set(&aborted) {
                        break;
                    }
                    let position = next.fetch_add(1, Ordering::SeqCst);
                    let Some(item) = planned.get(position) else {
                        break;
                    };
                    let outcome = upload_one(client, item, options);
                    if let Some(reason) = outcome.fatal {
                        error!(page = %item.target.remote_page_name, error = %reason, "stopping upload");
                        let mut aborted = lock(&aborted);
                        if aborted.is_none() {
                            *aborted = Some(reason);
                        }
                    }
                    *lock(&slots[position]) = Some(outcome.result);
                }
            });
        }
    });

    let results: Vec<UploadResult> = slots
        .into_iter()
        .filter_map(|slot| slot.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()))
        .collect();
    let aborted = aborted
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    summarize(client, results, total, options.cancel.is_cancelled(), aborted)
}

struct Outcome {
    result: UploadResult,
    fatal: Option<String>,
}

fn upload_one<A: WikiApi>(
    client: &SessionClient<A>,
    item: &PlannedUpload,
    options: &ExecuteOptions,
) -> Outcome {
    let target = &item.target;
    let result = |status, attempts, error_detail| UploadResult {
        local_path: target.relative_path.clone(),
        remote_page_name: target.remote_page_name.clone(),
        content_kind: target.content_kind,
        status,
        attempts,
        error_detail,
    };

    if item.action == PlanAction::Skip {
        return Outcome {
            result: result(UploadStatus::Skipped, 0, None),
            fatal: None,
        };
    }

    let mut attempts = 0usize;
    loop {
        attempts += 1;
        match client.write_page(
            &target.remote_page_name,
            target.payload.as_bytes(),
            target.content_kind,
            target.mime_type,
        ) {
            Ok(()) => {
                info!(page = %target.remote_page_name, attempts, "uploaded");
                return Outcome {
                    result: result(UploadStatus::Ok, attempts, None),
                    fatal: None,
                };
            }
            Err(error) if error.is_transient() && attempts <= options.retry.max_retries => {
                let delay = options.retry.delay_for(attempts - 1);
                debug!(
                    page = %target.remote_page_name,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, retrying"
                );
                thread::sleep(delay);
            }
            Err(error) => {
                warn!(page = %target.remote_page_name, attempt = attempts, error = %error, "upload failed");
                let fatal = error.is_fatal().then(|| error.to_string());
                return Outcome {
                    result: result(UploadStatus::Failed, attempts, Some(error.to_string())),
                    fatal,
                };
            }
        }
    }
}

fn summarize<A: WikiApi>(
    client: &SessionClient<A>,
    results: Vec<UploadResult>,
    total: usize,
    cancelled: bool,
    aborted: Option<String>,
) -> UploadReport {
    let count = |status: UploadStatus| results.iter().filter(|result| result.status == status).count();
    let ok = count(UploadStatus::Ok);
    let skipped = count(UploadStatus::Skipped);
    let failed = count(UploadStatus::Failed);
    let not_attempted = total - results.len();
    if not_attempted > 0 {
        warn!(not_attempted, "stopped before every target was attempted");
    }
    UploadReport {
        success: failed == 0 && !cancelled && aborted.is_none() && not_attempted == 0,
        ok,
        skipped,
        failed,
        not_attempted,
        cancelled,
        aborted,
        relogins: client.relogin_count(),
        request_count: client.request_count(),
        results,
    }
}

fn is_set(aborted: &Mutex<Option<String>>) -> bool {
    lock(aborted).is_some()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
