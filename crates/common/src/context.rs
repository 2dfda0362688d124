/// Implemented by crate error types that can wrap a plain message string.
///
/// Pair with [`impl_context!`] to get `.context()` / `.with_context()` for
/// that error type.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Generate a crate-local `Context` trait with `.context()` and
/// `.with_context()` on `Result` and `Option`, producing the named error
/// type.
///
/// Invoke in the module that defines the error, which must implement
/// [`FromMessage`]:
///
/// ```ignore
/// parley_common::impl_context!(Error);
/// ```
#[macro_export]
macro_rules! impl_context {
    ($error:ty) => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> std::result::Result<T, $error>;
            fn with_context<C, F>(self, f: F) -> std::result::Result<T, $error>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> std::result::Result<T, $error> {
                let context = context.into();
                self.with_context(move || context)
            }

            fn with_context<C, F>(self, f: F) -> std::result::Result<T, $error>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|source| {
                    <$error as $crate::FromMessage>::from_message(format!(
                        "{}: {source}",
                        f().into()
                    ))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> std::result::Result<T, $error> {
                let context = context.into();
                self.with_context(move || context)
            }

            fn with_context<C, F>(self, f: F) -> std::result::Result<T, $error>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <$error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}
