//! Gateway and worker configuration loaded from environment variables.
//!
//! [`Settings::from_env`] reads the process environment (after `.env` was
//! loaded by the binary). [`Settings::from_lookup`] takes any key lookup,
//! which keeps the parsing testable without touching the real environment.

use std::path::PathBuf;
use std::str::FromStr;

use crate::pipeline::QueueWorkers;
use crate::{Error, Result};

/// Where the gateway gets its workers from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum WorkerMode {
    /// Launch `kyu-worker` processes at boot and stop them at teardown.
    Process,
    /// Run worker pools as tasks inside the gateway process.
    InProcess,
    /// Workers are managed outside the gateway.
    External,
}

/// One analysis service and how its jobs are queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub host: String,
    pub port: u16,
    pub job_name: String,
    pub job_queue: String,
    pub request_path: String,
    pub job_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl ServiceSettings {
    /// Base URL of the service.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn defaults(
        host: &str,
        job_name: &str,
        job_queue: &str,
        request_path: &str,
        job_timeout_secs: u64,
    ) -> Self {
        Self {
            host: host.to_string(),
            port: 8000,
            job_name: job_name.to_string(),
            job_queue: job_queue.to_string(),
            request_path: request_path.to_string(),
            job_timeout_secs,
            read_timeout_secs: job_timeout_secs,
            connect_timeout_secs: 5,
        }
    }

    /// Apply `<PREFIX>_*` overrides.
    fn load(mut self, prefix: &str, env: &Env<'_>) -> Result<Self> {
        if let Some(host) = env.string(&format!("{prefix}_HOST")) {
            self.host = host;
        }
        self.port = env.parse(&format!("{prefix}_PORT"), self.port)?;
        if let Some(job_name) = env.string(&format!("{prefix}_JOB_NAME")) {
            self.job_name = job_name;
        }
        if let Some(job_queue) = env.string(&format!("{prefix}_JOB_QUEUE")) {
            self.job_queue = job_queue;
        }
        self.job_timeout_secs = env.parse(&format!("{prefix}_JOB_TIMEOUT"), self.job_timeout_secs)?;
        // The read timeout follows the job timeout unless set on its own.
        self.read_timeout_secs = env.parse(&format!("{prefix}_READ_TIMEOUT"), self.job_timeout_secs)?;
        self.connect_timeout_secs =
            env.parse(&format!("{prefix}_CONNECT_TIMEOUT"), self.connect_timeout_secs)?;
        Ok(self)
    }
}

/// Settings of every analysis service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicesSettings {
    pub crema: ServiceSettings,
    pub demucs: ServiceSettings,
    pub allin1_spectrograms: ServiceSettings,
    pub allin1_structure: ServiceSettings,
    pub whisper: ServiceSettings,
}

impl Default for ServicesSettings {
    fn default() -> Self {
        Self {
            crema: ServiceSettings::defaults("crema-webapi", "crema", "cpu_queue", "/", 30),
            demucs: ServiceSettings::defaults("demucs-webapi", "demucs", "gpu_queue", "/", 300),
            allin1_spectrograms: ServiceSettings::defaults(
                "allin1-webapi",
                "allin1_spectrograms",
                "cpu_queue",
                "/spectrograms",
                120,
            ),
            allin1_structure: ServiceSettings::defaults(
                "allin1-webapi",
                "allin1_structure",
                "gpu_queue",
                "/structure",
                120,
            ),
            whisper: ServiceSettings::defaults(
                "faster-whisper-webapi",
                "whisper",
                "gpu_queue",
                "/",
                300,
            ),
        }
    }
}

impl ServicesSettings {
    pub fn iter(&self) -> impl Iterator<Item = &ServiceSettings> {
        [
            &self.crema,
            &self.demucs,
            &self.allin1_spectrograms,
            &self.allin1_structure,
            &self.whisper,
        ]
        .into_iter()
    }
}

/// Gateway settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub bind_address: String,
    pub port: u16,
    pub consumer_volume_path: PathBuf,
    pub anonymous_consumer_name: String,
    pub consumer_id_header: String,
    pub gpu_queue: QueueWorkers,
    pub cpu_queue: QueueWorkers,
    pub worker_mode: WorkerMode,
    /// Explicit worker executable; `None` means the `kyu-worker` next to the
    /// running binary.
    pub worker_binary: Option<PathBuf>,
    pub job_result_ttl_secs: u64,
    pub log_dir: String,
    pub services: ServicesSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:kyu.db?mode=rwc".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            consumer_volume_path: PathBuf::from("./volume"),
            anonymous_consumer_name: "anonymous".to_string(),
            consumer_id_header: "x-consumer-id".to_string(),
            gpu_queue: QueueWorkers {
                queue_name: "gpu_queue".to_string(),
                multiplicity: 1,
            },
            cpu_queue: QueueWorkers {
                queue_name: "cpu_queue".to_string(),
                multiplicity: 1,
            },
            worker_mode: WorkerMode::Process,
            worker_binary: None,
            job_result_ttl_secs: 3 * 24 * 60 * 60,
            log_dir: "./logs".to_string(),
            services: ServicesSettings::default(),
        }
    }
}

/// Environment lookup with typed accessors.
struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    /// Non-empty value of `key`.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::config(format!("{key}={raw:?} is invalid: {e}"))),
            None => Ok(default),
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup: &lookup };
        let mut settings = Self::default();

        if let Some(url) = env.string("DATABASE_URL") {
            settings.database_url = url;
        }
        if let Some(address) = env.string("API_BIND_ADDRESS") {
            settings.bind_address = address;
        }
        settings.port = env.parse("API_PORT", settings.port)?;
        if let Some(path) = env.string("CONSUMER_VOLUME_PATH") {
            settings.consumer_volume_path = PathBuf::from(path);
        }
        if let Some(name) = env.string("ANONYMOUS_CONSUMER_NAME") {
            settings.anonymous_consumer_name = name;
        }
        if let Some(header) = env.string("HTTP_HEADER_CONSUMER_ID") {
            settings.consumer_id_header = header.to_ascii_lowercase();
        }

        if let Some(queue) = env.string("GPU_WORKER_QUEUE") {
            settings.gpu_queue.queue_name = queue;
        }
        settings.gpu_queue.multiplicity =
            env.parse("GPU_WORKER_MULTIPLICITY", settings.gpu_queue.multiplicity)?;
        if let Some(queue) = env.string("CPU_WORKER_QUEUE") {
            settings.cpu_queue.queue_name = queue;
        }
        settings.cpu_queue.multiplicity =
            env.parse("CPU_WORKER_MULTIPLICITY", settings.cpu_queue.multiplicity)?;

        settings.worker_mode = env.parse("WORKER_MODE", settings.worker_mode)?;
        settings.worker_binary = env.string("WORKER_BINARY").map(PathBuf::from);
        settings.job_result_ttl_secs = env.parse("JOB_RESULT_TTL_SECS", settings.job_result_ttl_secs)?;
        if let Some(dir) = env.string("LOG_DIR") {
            settings.log_dir = dir;
        }

        let services = ServicesSettings::default();
        settings.services = ServicesSettings {
            crema: services.crema.load("CREMA", &env)?,
            demucs: services.demucs.load("DEMUCS", &env)?,
            allin1_spectrograms: services.allin1_spectrograms.load("ALLIN1_SPECTROGRAMS", &env)?,
            allin1_structure: services.allin1_structure.load("ALLIN1_STRUCTURE", &env)?,
            whisper: services.whisper.load("WHISPER", &env)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.gpu_queue.queue_name == self.cpu_queue.queue_name {
            return Err(Error::config(format!(
                "GPU and CPU worker queues must differ, both are {}",
                self.gpu_queue.queue_name
            )));
        }

        let queues = self.worker_queues();
        for service in self.services.iter() {
            if !queues.iter().any(|q| q.queue_name == service.job_queue) {
                return Err(Error::config(format!(
                    "job {} uses queue {}, which is not a configured worker queue",
                    service.job_name, service.job_queue
                )));
            }
            for (timeout, secs) in [
                ("job", service.job_timeout_secs),
                ("read", service.read_timeout_secs),
                ("connect", service.connect_timeout_secs),
            ] {
                if secs == 0 {
                    return Err(Error::config(format!(
                        "job {} must have a positive {timeout} timeout",
                        service.job_name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The worker queues and their multiplicity.
    pub fn worker_queues(&self) -> Vec<QueueWorkers> {
        vec![self.gpu_queue.clone(), self.cpu_queue.clone()]
    }

    /// Worker executable for `process` mode.
    pub fn resolve_worker_binary(&self) -> Result<PathBuf> {
        if let Some(binary) = &self.worker_binary {
            return Ok(binary.clone());
        }
        let current = std::env::current_exe()?;
        let dir = current
            .parent()
            .ok_or_else(|| Error::config("cannot locate the gateway executable directory"))?;
        Ok(dir.join(format!("kyu-worker{}", std::env::consts::EXE_SUFFIX)))
    }
}
