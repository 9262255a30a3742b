//! Late-bound service tables.
//!
//! Lower crates call into collaborators that only a higher crate can
//! provide (the boot crate sees the platform, the core crate does not).
//! `define_service!` declares a table of function pointers, a one-shot
//! registration function, and a free-function wrapper per entry.

/// Declare a service table.
///
/// ```ignore
/// kestrel_lib::define_service! {
///     platform => PlatformServices {
///         timer_ticks() -> u64;
///     }
/// }
/// // generates: PlatformServices, register_platform_services,
/// // platform_services, platform_services_registered, timer_ticks()
/// ```
#[macro_export]
macro_rules! define_service {
    (
        $(#[$meta:meta])*
        $name:ident => $ty:ident {
            $(
                $(#[$fmeta:meta])*
                $fn_name:ident ( $($arg:ident : $arg_ty:ty),* $(,)? ) $(-> $ret:ty)? ;
            )*
        }
    ) => {
        $crate::paste::paste! {
            $(#[$meta])*
            pub struct $ty {
                $(
                    $(#[$fmeta])*
                    pub $fn_name: fn($($arg_ty),*) $(-> $ret)?,
                )*
            }

            static [<$name:upper _SERVICES>]: $crate::spin::Once<&'static $ty> =
                $crate::spin::Once::new();

            /// Register the service table. Later registrations are ignored.
            pub fn [<register_ $name _services>](services: &'static $ty) {
                [<$name:upper _SERVICES>].call_once(|| services);
            }

            pub fn [<$name _services_registered>]() -> bool {
                [<$name:upper _SERVICES>].is_completed()
            }

            pub fn [<$name _services>]() -> &'static $ty {
                match [<$name:upper _SERVICES>].get() {
                    Some(services) => services,
                    None => $crate::fatal!(
                        "{} services used before registration",
                        stringify!($name)
                    ),
                }
            }

            $(
                $(#[$fmeta])*
                #[inline(always)]
                pub fn $fn_name($($arg: $arg_ty),*) $(-> $ret)? {
                    ([<$name _services>]().$fn_name)($($arg),*)
                }
            )*
        }
    };
}

#[cfg(test)]
mod tests {
    crate::define_service! {
        probe => ProbeServices {
            answer() -> u32;
            double(x: u32) -> u32;
        }
    }

    static PROBE: ProbeServices = ProbeServices {
        answer: || 42,
        double: |x| x * 2,
    };

    #[test]
    fn test_service_registration_and_wrappers() {
        register_probe_services(&PROBE);
        assert!(probe_services_registered());
        assert_eq!(answer(), 42);
        assert_eq!(double(21), 42);
    }
}
