//! In-memory package and application catalog.
//!
//! Reference implementation of the catalog traits, also used as the seeded
//! catalog in planner tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::app::Application;
use crate::error::GupError;
use crate::loc::Locator;

use super::{Applications, PackageEnvelope, Packages};

/// In-memory catalog of packages and applications.
#[derive(Default)]
pub struct MemoryCatalog {
    packages: Mutex<HashMap<Locator, (PackageEnvelope, Vec<u8>)>>,
    apps: Mutex<HashMap<Locator, Application>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package with its runtime labels and payload.
    pub fn add_package(
        &mut self,
        locator: Locator,
        runtime_labels: BTreeMap<String, String>,
        payload: Vec<u8>,
    ) {
        let envelope = PackageEnvelope {
            locator: locator.clone(),
            runtime_labels,
        };
        self.packages
            .get_mut()
            .expect("catalog lock")
            .insert(locator, (envelope, payload));
    }

    /// Register an application and its backing package.
    pub fn add_app(&mut self, app: Application) {
        self.add_package(app.package.clone(), BTreeMap::new(), Vec::new());
        self.apps
            .get_mut()
            .expect("catalog lock")
            .insert(app.package.clone(), app);
    }
}

#[async_trait]
impl Packages for MemoryCatalog {
    async fn foreach_package(
        &self,
        visit: &mut (dyn for<'a> FnMut(&'a PackageEnvelope) -> Result<()> + Send),
    ) -> Result<()> {
        let mut envelopes: Vec<PackageEnvelope> = {
            let packages = self.packages.lock().expect("catalog lock");
            packages.values().map(|(e, _)| e.clone()).collect()
        };
        envelopes.sort_by(|a, b| a.locator.cmp(&b.locator));
        for envelope in envelopes {
            visit(&envelope)?;
        }
        Ok(())
    }

    async fn read_package_envelope(&self, loc: &Locator) -> Result<PackageEnvelope> {
        let packages = self.packages.lock().expect("catalog lock");
        packages
            .get(loc)
            .map(|(envelope, _)| envelope.clone())
            .ok_or_else(|| GupError::NotFound(format!("package {loc}")).into())
    }

    async fn read_package(&self, loc: &Locator) -> Result<(PackageEnvelope, Vec<u8>)> {
        let packages = self.packages.lock().expect("catalog lock");
        packages
            .get(loc)
            .cloned()
            .ok_or_else(|| GupError::NotFound(format!("package {loc}")).into())
    }
}

#[async_trait]
impl Applications for MemoryCatalog {
    async fn get_app(&self, loc: &Locator) -> Result<Application> {
        let apps = self.apps.lock().expect("catalog lock");
        apps.get(loc)
            .cloned()
            .ok_or_else(|| GupError::NotFound(format!("application {loc}")).into())
    }

    async fn get_direct_app_dependencies(&self, app: &Application) -> Result<Vec<Application>> {
        let mut dependencies = Vec::new();
        for dep in &app.manifest.dependencies.apps {
            dependencies.push(self.get_app(dep).await?);
        }
        Ok(dependencies)
    }
}
