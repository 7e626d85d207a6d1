pub mod allocator;
pub mod renderer;

mod target;

pub use self::target::*;

pub mod tests {
    use std::sync::Once;
    pub static INIT: Once = Once::new();

    #[cfg(test)]
    pub fn test_init() {
        INIT.call_once(|| {
            tracing_subscriber::fmt::try_init().ok();
        });
    }
}
