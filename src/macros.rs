/// Define an enum that mirrors a wire-format numeric field, with an
/// `Unknown` catch-all variant for values the enum doesn't name.
///
/// This is the pattern every `wire` codec uses for fields such as
/// `EtherType`, ARP `Operation`/`Hardware`, and `IpProtocol`: the field
/// is a fixed-width integer on the wire, but only a handful of its
/// values are meaningful, and a re-implementation must still round-trip
/// the rest rather than reject them.
macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident($ty:ty) {
            $( $variant:ident = $value:expr ),+ $(,)?
        }
    ) => {
        #[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
        $( #[$enum_attr] )*
        pub enum $name {
            $( $variant ),*,
            Unknown($ty),
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant, )*
                    other => $name::Unknown(other),
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value, )*
                    $name::Unknown(other) => other,
                }
            }
        }
    }
}
