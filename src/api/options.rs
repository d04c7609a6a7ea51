use crate::io::Lz4BlockSize;
use crate::replica::{ReplicaOptions, SnapshotIoConfig};
use std::convert::TryFrom;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

const MIB: usize = 1024 * 1024;

/// Tunables for a raft member. Anything left as `None` gets a default.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    pub max_entries_per_append: Option<usize>,

    /// Snapshot once this many entries were applied since the last snapshot.
    pub snapshot_batch_count: Option<u64>,
    /// Snapshot once the retained log holds more than this many bytes.
    pub snapshot_data_threshold: Option<u64>,
    /// Entries kept in the log behind a snapshot, so slightly lagging followers don't need one.
    pub snapshot_retained_entries: Option<u64>,
    pub snapshot_chunk_size: Option<usize>,
    pub snapshot_block_size: Option<Lz4BlockSize>,
    /// Snapshot bytes beyond this are buffered in a temp file.
    pub spill_threshold: Option<usize>,
    /// Where spill files go. Defaults to the storage directory, or the OS temp dir.
    pub spill_directory: Option<PathBuf>,

    /// How long `ReplicatedLog::append` waits for the entry to be applied.
    pub commit_timeout: Option<Duration>,
    /// A leader that hasn't heard from a majority for this long rejects writes.
    pub isolated_check_interval: Option<Duration>,
    pub admission_open_limit: Option<usize>,
    pub admission_window: Option<usize>,
    pub admission_delay_ceiling: Option<Duration>,
    pub recovery_batch_size: Option<usize>,
    /// How long a membership change may take before it fails with `Timeout`. Adding a voting
    /// member includes catching it up, so this should allow for a snapshot transfer.
    pub membership_change_timeout: Option<Duration>,
}

pub(super) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub max_entries_per_append: usize,
    pub snapshot_batch_count: u64,
    pub snapshot_data_threshold: u64,
    pub snapshot_retained_entries: u64,
    pub snapshot_chunk_size: usize,
    pub snapshot_block_size: Lz4BlockSize,
    pub spill_threshold: usize,
    pub spill_directory: Option<PathBuf>,
    pub commit_timeout: Duration,
    pub isolated_check_interval: Duration,
    pub admission_open_limit: usize,
    pub admission_window: usize,
    pub admission_delay_ceiling: Duration,
    pub recovery_batch_size: usize,
    pub membership_change_timeout: Duration,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.isolated_check_interval <= self.leader_heartbeat_duration {
            return Err("Isolated leader check interval must be greater than leader's heartbeat");
        }
        if self.max_entries_per_append == 0 {
            return Err("Max entries per AppendEntries must be positive");
        }
        if self.snapshot_batch_count == 0 {
            return Err("Snapshot batch count must be positive");
        }
        if self.snapshot_chunk_size == 0 {
            return Err("Snapshot chunk size must be positive");
        }
        if self.spill_threshold == 0 {
            return Err("Spill threshold must be positive");
        }
        if self.admission_open_limit == 0 || self.admission_window == 0 {
            return Err("Admission open limit and window must be positive");
        }
        if self.recovery_batch_size == 0 {
            return Err("Recovery batch size must be positive");
        }
        if self.membership_change_timeout <= self.follower_max_timeout {
            return Err("Membership change timeout must be greater than follower's maximum timeout");
        }

        Ok(())
    }

    /// Spill files default to the storage directory so they stay on the same volume.
    pub(super) fn replica_options(&self, storage_directory: Option<&Path>) -> ReplicaOptions {
        let spill_directory = self
            .spill_directory
            .clone()
            .or_else(|| storage_directory.map(Path::to_path_buf));

        ReplicaOptions {
            heartbeat_duration: self.leader_heartbeat_duration,
            election_min_timeout: self.follower_min_timeout,
            election_max_timeout: self.follower_max_timeout,
            append_entries_timeout: self.leader_append_entries_timeout,
            max_entries_per_append: self.max_entries_per_append,
            snapshot_batch_count: self.snapshot_batch_count,
            snapshot_data_threshold: self.snapshot_data_threshold,
            snapshot_retained_entries: self.snapshot_retained_entries,
            snapshot_chunk_size: self.snapshot_chunk_size,
            isolated_check_interval: self.isolated_check_interval,
            recovery_batch_size: self.recovery_batch_size,
            membership_change_timeout: self.membership_change_timeout,
            snapshot_io: SnapshotIoConfig {
                max_chunk_size: self.snapshot_chunk_size,
                spill_threshold: self.spill_threshold,
                spill_directory,
                block_size: self.snapshot_block_size,
            },
        }
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let leader_heartbeat_duration = options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100));
        let values = RaftOptionsValidated {
            leader_heartbeat_duration,
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            max_entries_per_append: options.max_entries_per_append.unwrap_or(64),
            snapshot_batch_count: options.snapshot_batch_count.unwrap_or(20_000),
            snapshot_data_threshold: options.snapshot_data_threshold.unwrap_or(64 * MIB as u64),
            snapshot_retained_entries: options.snapshot_retained_entries.unwrap_or(0),
            snapshot_chunk_size: options.snapshot_chunk_size.unwrap_or(2_048_000),
            snapshot_block_size: options.snapshot_block_size.unwrap_or(Lz4BlockSize::Max256Kb),
            spill_threshold: options.spill_threshold.unwrap_or(32 * MIB),
            spill_directory: options.spill_directory,
            commit_timeout: options.commit_timeout.unwrap_or(Duration::from_secs(5)),
            isolated_check_interval: options
                .isolated_check_interval
                .unwrap_or(leader_heartbeat_duration * 10),
            admission_open_limit: options.admission_open_limit.unwrap_or(1000),
            admission_window: options.admission_window.unwrap_or(64),
            admission_delay_ceiling: options.admission_delay_ceiling.unwrap_or(Duration::from_secs(5)),
            recovery_batch_size: options.recovery_batch_size.unwrap_or(1000),
            membership_change_timeout: options.membership_change_timeout.unwrap_or(Duration::from_secs(10)),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let validated = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();
        assert_eq!(validated.isolated_check_interval, Duration::from_secs(1));
        assert_eq!(validated.snapshot_chunk_size, 2_048_000);

        let replica_options = validated.replica_options(Some(Path::new("/data/shard-1")));
        assert_eq!(
            replica_options.snapshot_io.spill_directory,
            Some(PathBuf::from("/data/shard-1"))
        );
        assert_eq!(validated.replica_options(None).snapshot_io.spill_directory, None);
    }

    #[test]
    fn timeouts_must_be_ordered() {
        let options = RaftOptions {
            leader_heartbeat_duration: Some(Duration::from_millis(600)),
            ..Default::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());

        let options = RaftOptions {
            follower_min_timeout: Some(Duration::from_millis(2000)),
            ..Default::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());

        let options = RaftOptions {
            snapshot_chunk_size: Some(0),
            ..Default::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());

        let options = RaftOptions {
            membership_change_timeout: Some(Duration::from_millis(1500)),
            ..Default::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }
}
