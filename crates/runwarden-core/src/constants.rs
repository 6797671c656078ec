pub mod files {
    pub const RUN_DATA_CACHE: &str = "run_data_cache.json";
    pub const JOB_INFORMATION: &str = "job_information.json";
    pub const ATTEMPT_LOG: &str = "attempts.jsonl";
    pub const RC: &str = "rc";
    pub const RC_TMP: &str = "rc.tmp";
    pub const STDERR: &str = "stderr";
    pub const STDERR_BACKGROUND: &str = "stderr.background";
    pub const JOB_SCRIPT: &str = "script";
    pub const UPDATED_JOB_SCRIPT: &str = "updated_script";
    pub const RUN_SCRIPT: &str = "run_script.sh";
}

pub mod dirs {
    pub const EXECUTION: &str = "execution";
    pub const LOCK: &str = "_lock";
    pub const RETRIES: &str = "retries";
    pub const ENGINE_ATTEMPT_PREFIX: &str = "attempt-";
}

pub mod rc_codes {
    pub const SUCCESS: &str = "0";
    pub const FAILED: i32 = -1;
}

pub mod keywords {
    pub const SUSPICIOUS_SUCCESS: &[&str] = &["err", "terminate", "killed"];
    pub const ERROR: &[&str] = &["err"];
}
