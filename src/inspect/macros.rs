/// Generate an [`Inspect`](crate::Inspect) impl for a continuation record.
///
/// Each field is listed with its kind:
///
/// - `user`: plain data, surrogated if a surrogator claims it (`Serialize`
///   and `DeserializeOwned` required)
/// - `surrogate`: a value with no plain form, e.g. a `Service<dyn Trait>`
/// - `awaiter`: the `u32` discriminator of the active suspension point
/// - `builder`: never persisted; rebuilt with `Default::default()`
///
/// ```ignore
/// struct Checkout {
///     state: u32,
///     order: String,
///     attempts: u32,
///     mailer: Service<dyn Mailer>,
///     scratch: Vec<u8>,
/// }
///
/// hibernate::inspect! {
///     Checkout {
///         awaiter state,
///         user order,
///         user attempts,
///         surrogate mailer,
///         builder scratch,
///     }
/// }
/// ```
#[macro_export]
macro_rules! inspect {
    ($ty:ident { $($kind:ident $field:ident),* $(,)? }) => {
        impl $crate::Inspect for $ty {
            fn layout() -> $crate::FlowResult<$crate::Layout> {
                Ok($crate::Layout::new()
                    $(.field(stringify!($field), $crate::__inspect_kind!($kind)))*)
            }

            fn dehydrate(&self, w: &mut $crate::FrameWriter<'_>) -> $crate::FlowResult<()> {
                $($crate::__inspect_write!($kind, w, stringify!($field), &self.$field);)*
                Ok(())
            }

            fn hydrate(r: &$crate::FrameReader<'_>) -> $crate::FlowResult<Self> {
                Ok(Self {
                    $($field: $crate::__inspect_read!($kind, r, stringify!($field)),)*
                })
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __inspect_kind {
    (user) => {
        $crate::FieldKind::User
    };
    (surrogate) => {
        $crate::FieldKind::User
    };
    (awaiter) => {
        $crate::FieldKind::Awaiter
    };
    (builder) => {
        $crate::FieldKind::Builder
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __inspect_write {
    (user, $w:ident, $name:expr, $value:expr) => {
        $w.user($name, $value)?
    };
    (surrogate, $w:ident, $name:expr, $value:expr) => {
        $w.surrogate($name, $value)?
    };
    (awaiter, $w:ident, $name:expr, $value:expr) => {
        $w.awaiter($name, *$value)?
    };
    (builder, $w:ident, $name:expr, $value:expr) => {
        ()
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __inspect_read {
    (user, $r:ident, $name:expr) => {
        $r.user($name)?
    };
    (surrogate, $r:ident, $name:expr) => {
        $r.surrogate($name)?
    };
    (awaiter, $r:ident, $name:expr) => {
        $r.awaiter($name)?
    };
    (builder, $r:ident, $name:expr) => {
        ::core::default::Default::default()
    };
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use std::sync::Arc;

    use crate::id::Id;
    use crate::inspect::{FieldKind, FrameReader, FrameWriter, Inspect};
    use crate::resolver::{TypeAlias, TypeResolver};
    use crate::surrogate::{
        Service, ServiceScope, ServiceSurrogator, SurrogateChain, SurrogateContext,
    };

    trait Greeter: Send + Sync {
        fn greet(&self, name: &str) -> String;
    }

    struct Plain;

    impl Greeter for Plain {
        fn greet(&self, name: &str) -> String {
            format!("hello {name}")
        }
    }

    struct Welcome {
        state: u32,
        name: String,
        visits: Vec<u32>,
        greeter: Service<dyn Greeter>,
        scratch: Option<String>,
    }

    inspect! {
        Welcome {
            awaiter state,
            user name,
            user visits,
            surrogate greeter,
            builder scratch,
        }
    }

    #[test]
    fn test_generated_impl_round_trips() {
        let mut builder = TypeResolver::builder();
        builder
            .register_as::<dyn Greeter>(TypeAlias::new("greeter"))
            .unwrap();
        let resolver = builder.build();
        let chain = SurrogateChain::new().with(ServiceSurrogator::new().register::<dyn Greeter>());
        let services = ServiceScope::new("app").with::<dyn Greeter>(Arc::new(Plain));
        let cx = SurrogateContext::new(&resolver, Id::new_flow(), &services);

        let layout = Welcome::layout().unwrap();
        assert_eq!(layout.get("scratch").unwrap().kind, FieldKind::Builder);
        assert_eq!(layout.get("greeter").unwrap().kind, FieldKind::User);

        let alias = TypeAlias::new("welcome");
        let original = Welcome {
            state: 1,
            name: "ada".to_string(),
            visits: vec![3, 5],
            greeter: services.get::<dyn Greeter>().unwrap(),
            scratch: Some("dropped".to_string()),
        };
        let mut w = FrameWriter::new(&alias, &layout, &chain, cx);
        original.dehydrate(&mut w).unwrap();
        let (fields, awaiter) = w.finish().unwrap();
        assert!(!fields.contains_key("scratch"));

        let r = FrameReader::new(&alias, &layout, &chain, cx, &fields, awaiter);
        let restored = Welcome::hydrate(&r).unwrap();
        assert_eq!(restored.state, 1);
        assert_eq!(restored.name, "ada");
        assert_eq!(restored.visits, vec![3, 5]);
        assert_eq!(restored.greeter.greet("bob"), original.greeter.greet("bob"));
        assert_eq!(restored.scratch, None);
    }
}
