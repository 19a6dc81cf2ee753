//! The test-body seam and the name registry behind worker subprocesses.
//!
//! A worker process cannot construct arbitrary embedder types, so the
//! embedder registers factories under stable names up front and both sides
//! of the pool agree on those names. The same names become the failure-file
//! stems.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::CaseContext;
use crate::error::HarnessError;

/// Error type test bodies return. Panics inside a body are captured as
/// failures too, so either style works.
pub type CaseError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One randomized test body.
///
/// `run` draws everything it needs from the context. Determinism of the
/// whole harness rests on the body consuming the stream identically given
/// the same seed; anything time- or environment-dependent belongs outside
/// the draw sequence.
pub trait Testable: Send {
    fn run(&mut self, ctx: &mut CaseContext) -> Result<(), CaseError>;
}

impl<F> Testable for F
where
    F: FnMut(&mut CaseContext) -> Result<(), CaseError> + Send,
{
    fn run(&mut self, ctx: &mut CaseContext) -> Result<(), CaseError> {
        self(ctx)
    }
}

/// Box a closure as a test body. Pins the closure's signature so call sites
/// don't need return-type annotations.
pub fn testable_fn<F>(body: F) -> Box<dyn Testable>
where
    F: FnMut(&mut CaseContext) -> Result<(), CaseError> + Send + 'static,
{
    Box::new(body)
}

type Factory = Arc<dyn Fn() -> Box<dyn Testable> + Send + Sync>;

/// Name -> factory registry. A fresh body instance is constructed per case.
#[derive(Clone, Default)]
pub struct TestableRegistry {
    factories: BTreeMap<String, Factory>,
}

impl TestableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under `name` (conventionally `module::testable`). Replaces
    /// any previous registration under the same name.
    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Testable> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_owned(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Construct a fresh body. Unknown names are configuration errors: the
    /// run should fail before any case executes, and a worker handed an
    /// unknown name has nothing useful to do.
    pub fn create(&self, name: &str) -> Result<Box<dyn Testable>, HarnessError> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(HarnessError::config(format!(
                "no testable registered under {name:?}"
            ))),
        }
    }
}

/// Last `::` segment of a registered name; the default failure-file stem.
pub fn simple_name(name: &str) -> &str {
    name.rsplit("::").next().unwrap_or(name)
}

/// Fully-qualified failure-file stem: path separators become dots.
pub fn qualified_name(name: &str) -> String {
    name.replace("::", ".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CaseSetup;

    #[test]
    fn registry_round_trip() {
        let mut reg = TestableRegistry::new();
        reg.register("demo::noop", || testable_fn(|_ctx| Ok(())));
        assert!(reg.contains("demo::noop"));
        assert!(!reg.contains("demo::other"));

        let mut body = reg.create("demo::noop").unwrap();
        let mut ctx = CaseSetup::new(&["placemark"]).context(1, false);
        assert!(body.run(&mut ctx).is_ok());
    }

    #[test]
    fn unknown_name_is_a_config_error() {
        let reg = TestableRegistry::new();
        assert!(matches!(
            reg.create("missing"),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn each_create_returns_a_fresh_instance() {
        struct OneShot {
            used: bool,
        }
        impl Testable for OneShot {
            fn run(&mut self, _ctx: &mut CaseContext) -> Result<(), CaseError> {
                assert!(!self.used, "body instance reused across cases");
                self.used = true;
                Ok(())
            }
        }
        let mut reg = TestableRegistry::new();
        reg.register("demo::oneshot", || Box::new(OneShot { used: false }));
        let mut ctx = CaseSetup::new(&["placemark"]).context(1, false);
        for _ in 0..3 {
            reg.create("demo::oneshot").unwrap().run(&mut ctx).unwrap();
        }
    }

    #[test]
    fn name_helpers() {
        assert_eq!(simple_name("queue::soak"), "soak");
        assert_eq!(simple_name("soak"), "soak");
        assert_eq!(qualified_name("queue::soak"), "queue.soak");
        assert_eq!(qualified_name("soak"), "soak");
    }
}
