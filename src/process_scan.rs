/// Process table scan: find another running copy of the application.
///
/// The scan is a single read-only pass over whatever the OS reports at call time.
/// It is a best-effort liveness check, not a lock: two copies starting at the same
/// moment can both miss each other.
use serde::Serialize;
use std::collections::HashSet;
use sysinfo::{ProcessRefreshKind, System, UpdateKind};

/// Snapshot of one OS process, valid only for the scan that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    /// Short process name. Empty when unavailable.
    pub name: String,
    /// Executable path. Empty when unavailable.
    pub exe: String,
    pub cmdline: Vec<String>,
}

impl ProcessRecord {
    /// True if this record looks like another instance of `app_name`.
    ///
    /// Case-sensitive. Matches when the name starts with `app_name`, or the
    /// executable path contains it, or the space-joined command line contains it.
    /// The record for `own_pid` never matches.
    pub fn matches(&self, app_name: &str, own_pid: u32) -> bool {
        if self.pid == own_pid {
            return false;
        }
        self.name.starts_with(app_name)
            || self.exe.contains(app_name)
            || self.cmdline.join(" ").contains(app_name)
    }
}

/// A single process whose metadata could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPartialReadError {
    pub pid: u32,
    pub reason: String,
}

impl std::fmt::Display for ScanPartialReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot read process {}: {}", self.pid, self.reason)
    }
}

impl std::error::Error for ScanPartialReadError {}

/// The process table itself could not be enumerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFatalError {
    /// Process enumeration is not available on this platform.
    Unsupported,
    /// Enumeration returned nothing, not even the calling process.
    EmptyTable,
}

impl std::fmt::Display for ScanFatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanFatalError::Unsupported => {
                write!(f, "process enumeration is not supported on this platform")
            }
            ScanFatalError::EmptyTable => {
                write!(f, "process enumeration returned an empty table")
            }
        }
    }
}

impl std::error::Error for ScanFatalError {}

/// One enumeration pass: each entry is a readable record or the reason it was not.
pub type Snapshot = Vec<Result<ProcessRecord, ScanPartialReadError>>;

/// Source of process records.
pub trait ProcessTable {
    fn snapshot(&mut self) -> Result<Snapshot, ScanFatalError>;
}

/// The live OS process table, read through `sysinfo`.
pub struct SysinfoTable {
    system: System,
}

impl SysinfoTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoTable {
    fn snapshot(&mut self) -> Result<Snapshot, ScanFatalError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(ScanFatalError::Unsupported);
        }

        self.system.refresh_processes_specifics(
            ProcessRefreshKind::new()
                .with_exe(UpdateKind::OnlyIfNotSet)
                .with_cmd(UpdateKind::OnlyIfNotSet),
        );

        let mut processes: Vec<_> = self.system.processes().values().collect();
        if processes.is_empty() {
            return Err(ScanFatalError::EmptyTable);
        }
        // Linux lists threads alongside processes; a thread is not another instance.
        let threads: HashSet<u32> = processes
            .iter()
            .copied()
            .flat_map(|p| {
                let owner = p.pid();
                p.tasks()
                    .into_iter()
                    .flatten()
                    .filter(move |tid| **tid != owner)
                    .map(|tid| tid.as_u32())
            })
            .collect();
        processes.retain(|p| !threads.contains(&p.pid().as_u32()));
        // HashMap order differs between System instances; pid order does not.
        processes.sort_by_key(|p| p.pid().as_u32());

        let records = processes
            .into_iter()
            .map(|process| {
                let pid = process.pid().as_u32();
                let name = process.name().to_string();
                let exe = process
                    .exe()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let cmdline = process.cmd().to_vec();

                // Exited mid-scan or access denied: sysinfo leaves every field blank.
                if name.is_empty() && exe.is_empty() && cmdline.is_empty() {
                    return Err(ScanPartialReadError {
                        pid,
                        reason: "no readable metadata".to_string(),
                    });
                }

                Ok(ProcessRecord {
                    pid,
                    name,
                    exe,
                    cmdline,
                })
            })
            .collect();

        Ok(records)
    }
}

/// Return the first process in `table` that is another instance of `app_name`.
///
/// Unreadable records are skipped. Only a failure to enumerate the table at all
/// is an error.
pub fn find_running_instance<T: ProcessTable + ?Sized>(
    table: &mut T,
    app_name: &str,
    own_pid: u32,
) -> Result<Option<ProcessRecord>, ScanFatalError> {
    let entries = table.snapshot()?;
    let total = entries.len();

    for entry in entries {
        let record = match entry {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(pid = e.pid, reason = %e.reason, "skipping unreadable process");
                continue;
            }
        };

        if record.matches(app_name, own_pid) {
            tracing::debug!(
                pid = record.pid,
                name = %record.name,
                exe = %record.exe,
                cmdline = ?record.cmdline,
                "process match"
            );
            return Ok(Some(record));
        }
    }

    tracing::debug!(app_name, scanned = total, "no running instance found");
    Ok(None)
}
