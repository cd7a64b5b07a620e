//! Fans species out over a bounded pool of worker threads.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::unbounded;

use crate::acquire::{AcquisitionResult, Acquirer, ProgressEvent, ProgressSink};
use crate::archive::ArchiveConnector;
use crate::domain::AssetRequest;
use crate::error::ErrorClass;

/// Runs every distinct request once and returns one result per request, in
/// input order. Requests that land in the same output directory are
/// collapsed to the first occurrence.
pub fn run<C: ArchiveConnector>(
    acquirer: &Acquirer<C>,
    requests: Vec<AssetRequest>,
    concurrency: usize,
    sink: &dyn ProgressSink,
) -> Vec<AcquisitionResult> {
    let requests = dedup(acquirer, requests, sink);
    if concurrency <= 1 || requests.len() <= 1 {
        return requests
            .iter()
            .map(|request| acquire_guarded(acquirer, request, sink))
            .collect();
    }

    let workers = concurrency.min(requests.len());
    let total = requests.len();
    let (job_tx, job_rx) = unbounded::<(usize, AssetRequest)>();
    let (result_tx, result_rx) = unbounded::<(usize, AcquisitionResult)>();
    for job in requests.into_iter().enumerate() {
        // the receiver is alive until the scope below ends
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    tracing::info!(workers, species = total, "starting worker pool");
    thread::scope(|scope| {
        for worker in 0..workers {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            scope.spawn(move || {
                while let Ok((index, request)) = jobs.recv() {
                    tracing::debug!(worker, species = %request.species(), "picked up species");
                    let result = acquire_guarded(acquirer, &request, sink);
                    if results.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut collected = result_rx.iter().collect::<Vec<_>>();
    collected.sort_by_key(|(index, _)| *index);
    collected.into_iter().map(|(_, result)| result).collect()
}

fn dedup<C: ArchiveConnector>(
    acquirer: &Acquirer<C>,
    requests: Vec<AssetRequest>,
    sink: &dyn ProgressSink,
) -> Vec<AssetRequest> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(requests.len());
    for request in requests {
        let directory = acquirer.layout().release_dir(&request);
        // case-insensitive filesystems would merge directories differing only in case
        if seen.insert(directory.as_str().to_lowercase()) {
            unique.push(request);
        } else {
            tracing::warn!(species = %request.species(), directory = %directory, "duplicate species skipped");
            sink.event(ProgressEvent::DuplicateSkipped {
                species: request.species().to_string(),
                directory,
            });
        }
    }
    unique
}

/// A panic while acquiring one species becomes a failed result for that
/// species only.
fn acquire_guarded<C: ArchiveConnector>(
    acquirer: &Acquirer<C>,
    request: &AssetRequest,
    sink: &dyn ProgressSink,
) -> AcquisitionResult {
    let span = tracing::info_span!("species", name = %request.species());
    let _entered = span.enter();
    match panic::catch_unwind(AssertUnwindSafe(|| acquirer.acquire(request, sink))) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(species = %request.species(), message = %message, "acquisition panicked");
            AcquisitionResult::failed(
                request,
                acquirer.layout().release_dir(request),
                ErrorClass::Internal,
                &format!("internal error: {message}"),
            )
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
