use modal_monitor::prelude::*;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Scheme with a small pool and few thin lock retries.
pub fn scheme(kind: SchemeKind, layout: WordLayout) -> ModalMonitorScheme {
    init_logging();
    let mut options = Options::default().with_layout(layout);
    options.scheme = kind;
    options.unbound_pool_image_size = 4;
    options.unbound_pool_grow = 4;
    options.unbound_pool_min = 2;
    options.thin_lock_retries = 3;
    ModalMonitorScheme::from_options(&options)
}

/// Every scheme on every layout, each with its own manager.
pub fn all_schemes() -> Vec<ModalMonitorScheme> {
    let mut schemes = Vec::new();
    for kind in [SchemeKind::Inflated, SchemeKind::ThinInflated] {
        for layout in [WordLayout::Wide64, WordLayout::Split32] {
            schemes.push(scheme(kind, layout));
        }
    }
    schemes
}
