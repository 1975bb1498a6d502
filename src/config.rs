pub mod settings;

pub use settings::{
    generate_default_config, AuthSettings, LimitsSettings, PercentRange, Settings, StatsRanges,
};
