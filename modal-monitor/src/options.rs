use std::sync::LazyLock;

use clap::{Parser, ValueEnum};

use crate::sync::lockword::WordLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LayoutChoice {
    /// Pick the layout matching the pointer width of the host.
    Host,
    Wide64,
    Split32,
}

impl LayoutChoice {
    pub fn resolve(self) -> WordLayout {
        match self {
            Self::Host => WordLayout::host(),
            Self::Wide64 => WordLayout::Wide64,
            Self::Split32 => WordLayout::Split32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchemeKind {
    /// Every lock is inflated on first use.
    Inflated,
    /// Thin locks that inflate on contention, deep recursion or wait.
    ThinInflated,
}

#[derive(Parser, Debug, Clone)]
pub struct Options {
    /// Number of monitors created when the pool is first populated.
    #[clap(long, default_value_t = 50)]
    pub unbound_pool_image_size: usize,

    /// Number of monitors added each time the pool grows.
    #[clap(long, default_value_t = 50)]
    pub unbound_pool_grow: usize,

    /// Free monitor count the pool tries to stay above.
    #[clap(long, default_value_t = 25)]
    pub unbound_pool_min: usize,

    /// Log monitor binding and unbinding.
    #[clap(long, default_value_t = false)]
    pub trace_monitors: bool,

    #[clap(long, value_enum, default_value_t = LayoutChoice::Host)]
    pub lock_word_layout: LayoutChoice,

    /// CAS attempts on a contended thin lock before it is inflated.
    #[clap(long, default_value_t = 20)]
    pub thin_lock_retries: usize,

    #[clap(long, value_enum, default_value_t = SchemeKind::ThinInflated)]
    pub scheme: SchemeKind,
}

impl Options {
    /// Options parsed from a whitespace separated flag string, as found in
    /// the `MODAL_MONITOR_OPTIONS` environment variable.
    pub fn from_flags(flags: &str) -> Result<Self, clap::Error> {
        Self::try_parse_from(std::iter::once("modal-monitor").chain(flags.split_whitespace()))
    }

    pub fn layout(&self) -> WordLayout {
        self.lock_word_layout.resolve()
    }

    pub fn with_layout(mut self, layout: WordLayout) -> Self {
        self.lock_word_layout = match layout {
            WordLayout::Wide64 => LayoutChoice::Wide64,
            WordLayout::Split32 => LayoutChoice::Split32,
        };
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::parse_from(["modal-monitor"])
    }
}

pub static OPTIONS: LazyLock<Options> = LazyLock::new(|| {
    let flags = std::env::var("MODAL_MONITOR_OPTIONS").unwrap_or_default();
    Options::from_flags(&flags).unwrap_or_else(|err| err.exit())
});
