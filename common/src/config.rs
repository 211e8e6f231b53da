//! Configuration types for runtime, scheduling and test execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

impl RuntimeConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers > 1024 {
            return Err(format!(
                "max_workers must not exceed 1024, got {}",
                self.max_workers
            ));
        }
        Ok(())
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// How many sessions may run at once.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingMode {
    /// One session runs at a time; the rest wait in FIFO order.
    Single,
    /// Up to `max_clients` sessions run concurrently.
    Bounded,
}

impl std::fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingMode::Single => write!(f, "single"),
            SchedulingMode::Bounded => write!(f, "bounded"),
        }
    }
}

/// Admission and queueing policy.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub mode: SchedulingMode,
    /// Queue bound in single mode, concurrency bound in bounded mode
    pub max_clients: usize,
    /// Budget used to estimate when a queued session will start
    pub per_session_budget: std::time::Duration,
    /// Hard ceiling on time spent waiting in the queue
    pub max_queue_wait: std::time::Duration,
    /// Heartbeat scans run only while more sessions than this are waiting
    pub heartbeat_threshold: usize,
    /// Queue positions exempt from heartbeat probing
    pub heartbeat_skip: usize,
    /// Maximum number of sessions probed in one heartbeat pass
    pub heartbeat_batch: usize,
    /// How long a probed client has to answer
    pub heartbeat_deadline: std::time::Duration,
    /// Accept timeout while sessions are queued, drives housekeeping
    pub housekeeping_interval: std::time::Duration,
    /// Deadline for the probe + login exchange of a new connection
    pub handshake_deadline: std::time::Duration,
    /// Absolute deadline for a running session
    pub session_lifetime: std::time::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulingMode::Single,
            max_clients: 50,
            per_session_budget: std::time::Duration::from_secs(45),
            max_queue_wait: std::time::Duration::from_secs(70),
            heartbeat_threshold: 5,
            heartbeat_skip: 4,
            heartbeat_batch: 8,
            heartbeat_deadline: std::time::Duration::from_millis(1500),
            housekeeping_interval: std::time::Duration::from_secs(3),
            handshake_deadline: std::time::Duration::from_secs(60),
            session_lifetime: std::time::Duration::from_secs(300),
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.max_clients == 0 {
            return Err("max_clients must be at least 1".to_string());
        }
        if self.max_queue_wait.is_zero() {
            return Err("max_queue_wait must be greater than zero".to_string());
        }
        if self.heartbeat_batch == 0 {
            return Err("heartbeat_batch must be at least 1".to_string());
        }
        if self.housekeeping_interval.is_zero() {
            return Err("housekeeping_interval must be greater than zero".to_string());
        }
        if self.session_lifetime.is_zero() {
            return Err("session_lifetime must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Per-test timing and socket parameters.
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Control port; data listeners use fixed offsets from it
    pub base_port: u16,
    /// Restrict data listeners to these ranges (e.g. "3001-3010")
    pub port_ranges: Option<String>,
    /// Duration of each throughput transfer
    pub throughput_duration: std::time::Duration,
    /// Duration of the window-limited middlebox stream
    pub middlebox_duration: std::time::Duration,
    /// Pause between accepting the C2S connection and signalling start
    pub c2s_start_delay: std::time::Duration,
    /// Interval between telemetry samples
    pub sample_interval: std::time::Duration,
    /// Per-attempt timeout when waiting for a data connection
    pub accept_timeout: std::time::Duration,
    /// Number of accept attempts before giving up
    pub accept_attempts: u32,
    /// Skip S2C writes while too much data is unacknowledged
    pub avoid_sndblock_up: bool,
    /// Size of the buffer written per S2C send
    pub write_buffer_size: usize,
    /// Deadline for a single control-channel receive
    pub control_deadline: std::time::Duration,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            base_port: 3001,
            port_ranges: None,
            throughput_duration: std::time::Duration::from_secs(10),
            middlebox_duration: std::time::Duration::from_secs(5),
            c2s_start_delay: std::time::Duration::from_secs(2),
            sample_interval: std::time::Duration::from_millis(5),
            accept_timeout: std::time::Duration::from_secs(5),
            accept_attempts: 5,
            avoid_sndblock_up: false,
            write_buffer_size: 8192,
            control_deadline: std::time::Duration::from_secs(600),
        }
    }
}

impl TestConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.port_ranges.is_none() && self.base_port > u16::MAX - 2 {
            return Err(format!(
                "base port {} leaves no room for data ports",
                self.base_port
            ));
        }
        if self.throughput_duration.is_zero() {
            return Err("throughput_duration must be greater than zero".to_string());
        }
        if self.sample_interval.is_zero() {
            return Err("sample_interval must be greater than zero".to_string());
        }
        if self.accept_attempts == 0 {
            return Err("accept_attempts must be at least 1".to_string());
        }
        if self.write_buffer_size == 0 {
            return Err("write_buffer_size must be at least 1".to_string());
        }
        Ok(())
    }
}
