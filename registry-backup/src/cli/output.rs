//! JSON run summaries printed on stdout.

use std::io::Write;
use std::process::ExitCode;

use serde_json::{json, Value};

use registry_backup::backup::BackupOutcome;
use registry_backup::restore::RestoreOutcome;
use registry_backup::transfer::TransferReport;
use registry_backup::unlock::UnlockReport;
use registry_backup::verify::{VerifyReport, VerifyStatus};

/// Failures listed in a summary.
const SHOWN_ERRORS: usize = 5;

#[derive(Debug)]
pub(crate) struct Output {
    value: Value,
    success: bool,
}

impl Output {
    pub(crate) fn print(&self) -> eyre::Result<()> {
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, &self.value)?;
        writeln!(stdout)?;
        Ok(())
    }

    pub(crate) fn exit_code(&self) -> ExitCode {
        if self.success {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

fn errors(report: &TransferReport) -> Option<Value> {
    if report.failed.is_empty() {
        return None;
    }
    Some(
        report
            .failed
            .iter()
            .take(SHOWN_ERRORS)
            .map(|failed| Value::String(format!("{}: {}", failed.digest, failed.error)))
            .collect(),
    )
}

fn with_errors(mut value: Value, report: &TransferReport) -> Value {
    if let (Some(errors), Some(object)) = (errors(report), value.as_object_mut()) {
        object.insert("Errors".into(), errors);
    }
    value
}

pub(crate) fn backup(outcome: &BackupOutcome) -> Output {
    let value = json!({
        "Operation": "Backup",
        "Namespace": outcome.namespace.name,
        "BackupNumber": outcome.backup_number,
        "Summary": outcome.record.summary,
    });
    Output {
        value: with_errors(value, &outcome.report),
        success: outcome.report.is_success(),
    }
}

pub(crate) fn restore(outcome: &RestoreOutcome) -> Output {
    match outcome {
        RestoreOutcome::DryRun(report) => Output {
            value: json!({
                "Operation": "Restore (Dry Run)",
                "Namespace": report.namespace,
                "BackupNumber": report.backup_number,
                "Repository": report.repository,
                "Summary": {
                    "RepositoriesToRestore": report.repositories_to_restore,
                    "ManifestsToRestore": report.manifests_to_restore,
                    "TotalBlobs": report.total_blobs,
                    "ExistingBlobs": report.existing_blobs,
                    "BlobsToDownload": report.blobs_to_download,
                },
                "Actions": report.actions(),
            }),
            success: true,
        },
        RestoreOutcome::Restored(report) => {
            let value = json!({
                "Operation": "Restore",
                "Namespace": report.namespace,
                "BackupNumber": report.backup_number,
                "Repository": report.repository,
                "Restore Summary": report.summary,
            });
            Output {
                value: with_errors(value, &report.report),
                success: report.report.is_success(),
            }
        }
    }
}

pub(crate) fn verify(report: &VerifyReport) -> Output {
    let mut value = json!({
        "Operation": "Verify",
        "Namespace": report.namespace,
        "Verify Summary": {
            "Completed": report.completed,
            "Inventory": report.backup_number.to_string(),
            "InventoryStatus": report.inventory_status,
            "Status": report.status.to_string(),
            "RepositoriesSeen": report.repositories_seen.to_string(),
            "ManifestsSeen": report.manifests_seen.to_string(),
            "Data": {
                "Blobs": report.current_blobs.to_string(),
                "InventoryBlobs": report.inventory_blobs.to_string(),
                "ExtraBlobs": report.extra.to_string(),
            },
        },
    });

    if report.missing > 0 {
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "IncompleteDetails".into(),
                json!({
                    "MissingBlobs": report.missing,
                    "ExampleMissingBlobs": report.missing_examples,
                    "MissingPresentInBackupStorage": report.missing_in_backup_storage,
                }),
            );
        }
    }

    Output {
        value,
        success: report.status == VerifyStatus::Complete,
    }
}

pub(crate) fn unlock(report: &UnlockReport) -> Output {
    let mut value = json!({
        "Operation": "Unlock",
        "Namespace": report.namespace,
        "LockExisted": report.lock_existed,
        "Message": report.message,
    });
    if let (Some(lease), Some(object)) = (&report.lease, value.as_object_mut()) {
        object.insert(
            "Lease".into(),
            json!({
                "Owner": lease.owner,
                "Token": lease.token,
                "Acquired": lease.acquired.to_rfc3339(),
            }),
        );
    }
    Output {
        value,
        success: true,
    }
}

pub(crate) fn failure(operation: &str, error: &eyre::Report) -> Output {
    Output {
        value: json!({
            "Operation": operation,
            "Status": "Failed",
            "Error": format!("{error:#}"),
        }),
        success: false,
    }
}
