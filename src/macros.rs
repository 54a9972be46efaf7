#[doc(hidden)]
#[macro_export]
macro_rules! string_based_wrapper_type {
    (
        $(#[$outer:meta])*
        $struct_name: ident
    ) => {
        $(#[$outer])*
        #[derive(
            Debug,
            Clone,
            serde::Deserialize,
            serde::Serialize,
            Hash,
            Ord,
            PartialOrd,
            Eq,
            PartialEq,
        )]
        #[serde(transparent)]
        pub struct $struct_name(String);

        impl std::fmt::Display for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<String> for $struct_name {
            fn from(id: String) -> Self {
                $struct_name(id)
            }
        }

        impl From<&str> for $struct_name {
            fn from(id: &str) -> Self {
                $struct_name(id.to_string())
            }
        }

        impl AsRef<str> for $struct_name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl $struct_name {
            /// The raw controller-assigned identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}
