/// Implements `From<$payload>` for an enum by wrapping the value in `$variant`.
///
/// Used for error enums whose payload type comes from another crate and so
/// cannot carry a `#[from]` next to a second variant with the same source.
///
/// # Examples
///
/// ```
/// use net_dot_clock::impl_from_variant;
///
/// #[derive(Debug, PartialEq)]
/// enum FlashFailure {
///     Code(u32),
/// }
///
/// impl_from_variant!(FlashFailure, Code, u32);
///
/// let failure: FlashFailure = 7u32.into();
/// assert_eq!(failure, FlashFailure::Code(7));
/// ```
#[macro_export]
macro_rules! impl_from_variant {
    ($dst_enum:ident, $variant:ident, $payload:ident) => {
        impl From<$payload> for $dst_enum {
            fn from(value: $payload) -> Self {
                Self::$variant(value)
            }
        }
    };
}

/// Moves `$val` into a `'static` cell and returns `&'static mut $t`.
///
/// Each expansion owns its own cell, so a given call site may run only once.
#[cfg(feature = "esp32")]
#[macro_export]
macro_rules! mk_static {
    ($t:ty, $val:expr) => {{
        static STATIC_CELL: static_cell::StaticCell<$t> = static_cell::StaticCell::new();
        #[deny(unused_attributes)]
        let x = STATIC_CELL.uninit().write(($val));
        x
    }};
}
