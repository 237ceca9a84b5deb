use pointstream_cloud::config::{BuildConfig, CacheConfig, CloudConfig, SchedulerConfig};
use pointstream_cloud::Status;

use serde::{Deserialize, Serialize};

/// Everything an [`Engine`](crate::Engine) and the container builder can be tuned with. Missing fields take their defaults.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub build: BuildConfig,
    pub cloud: CloudConfig,
}

impl Config {
    pub fn read_file(path: &str) -> Result<Self, ron::Error> {
        let reader = std::fs::File::open(path)?;

        ron::de::from_reader(reader)
    }

    pub fn validate(&self) -> Result<(), Status> {
        self.cache.validate()?;
        self.scheduler.validate()?;
        self.build.validate()
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
