//! 🗂️ Output Registry — stable names to output factories.
//!
//! The host asks for `"output-elasticsearch"` and gets back a configured
//! `Box<dyn Output>`. Registering a name twice is a mistake and says so.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Result, bail};
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::output::{ElasticsearchOutput, Output, OutputParams};

/// 🏷️ The name the Elasticsearch output registers under.
pub const ELASTICSEARCH_OUTPUT: &str = "output-elasticsearch";

/// 🏭 Builds (configures) an output from host params.
pub type OutputFactory = fn(OutputParams) -> BoxFuture<'static, Result<Box<dyn Output>>>;

#[derive(Clone)]
pub struct OutputRegistry {
    factories: BTreeMap<String, OutputFactory>,
}

impl OutputRegistry {
    /// 📭 A registry with nothing in it.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: OutputFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            bail!("💀 An output named '{name}' is already registered");
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// 🚀 Look up `name` and configure a fresh output with `params`.
    pub async fn create(&self, name: &str, params: OutputParams) -> Result<Box<dyn Output>> {
        let Some(factory) = self.factories.get(name) else {
            let known: Vec<&str> = self.names().collect();
            bail!("💀 Unknown output '{name}'. Known outputs: {}", known.join(", "));
        };
        factory(params).await
    }
}

impl Default for OutputRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .factories
            .insert(ELASTICSEARCH_OUTPUT.to_string(), elasticsearch_factory);
        registry
    }
}

impl fmt::Debug for OutputRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputRegistry")
            .field("names", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

fn elasticsearch_factory(params: OutputParams) -> BoxFuture<'static, Result<Box<dyn Output>>> {
    async move {
        let output = ElasticsearchOutput::new(params).await?;
        Ok(Box::new(output) as Box<dyn Output>)
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never_configures(_params: OutputParams) -> BoxFuture<'static, Result<Box<dyn Output>>> {
        async { bail!("💀 this output is decorative") }.boxed()
    }

    #[test]
    fn the_one_where_elasticsearch_is_there_out_of_the_box() {
        let registry = OutputRegistry::default();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec![ELASTICSEARCH_OUTPUT]);
    }

    #[test]
    fn the_one_where_the_same_name_cannot_be_taken_twice() {
        let mut registry = OutputRegistry::default();
        let err = registry
            .register(ELASTICSEARCH_OUTPUT, never_configures)
            .expect_err("duplicate name");
        assert!(err.to_string().contains("already registered"));
        assert!(registry.register("output-decorative", never_configures).is_ok());
        assert_eq!(registry.names().count(), 2);
    }

    #[tokio::test]
    async fn the_one_where_an_unknown_name_lists_the_menu() {
        let registry = OutputRegistry::default();
        let err = registry
            .create("output-carrier-pigeon", OutputParams::default())
            .await
            .err()
            .expect("unknown output");
        let message = err.to_string();
        assert!(message.contains("output-carrier-pigeon"));
        assert!(message.contains(ELASTICSEARCH_OUTPUT));
    }

    #[tokio::test]
    async fn the_one_where_the_factory_error_comes_through_untouched() {
        let mut registry = OutputRegistry::empty();
        registry.register("output-decorative", never_configures).expect("fresh name");
        let err = registry
            .create("output-decorative", OutputParams::default())
            .await
            .err()
            .expect("factory fails");
        assert!(err.to_string().contains("decorative"));
    }
}
