pub(crate) mod log;
pub(crate) mod normal;
pub(crate) mod varbuilder_utils;

/// Defines a function returning a constant, for use with `#[serde(default = "...")]`.
#[macro_export]
macro_rules! serde_default_fn {
    ($t:ty, $name:ident, $v:expr) => {
        fn $name() -> $t {
            $v
        }
    };
}
