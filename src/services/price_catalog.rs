use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::SelectedItem;

/// A priced line of a legal service offering, in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PriceComponent {
    pub id: Uuid,
    pub service_id: Uuid,
    pub name: String,
    pub price: i64,
    #[serde(default)]
    pub discount: i64,
    #[serde(default)]
    pub is_compulsory: bool,
}

impl PriceComponent {
    pub fn final_price(&self) -> i64 {
        (self.price - self.discount).max(0)
    }

    fn snapshot(&self) -> SelectedItem {
        SelectedItem {
            price_component_id: self.id,
            price_at_order_time: self.price,
            discount_at_order_time: self.discount,
            final_price: self.final_price(),
            is_compulsory: self.is_compulsory,
        }
    }
}

/// Read side of the service catalog, owned elsewhere.
#[async_trait]
pub trait PriceCatalog: Send + Sync {
    /// Components for the given ids; unknown ids are simply absent.
    async fn components(&self, ids: &[Uuid]) -> Result<Vec<PriceComponent>, ServiceError>;

    async fn components_for_service(
        &self,
        service_id: Uuid,
    ) -> Result<Vec<PriceComponent>, ServiceError>;
}

#[derive(Default)]
pub struct InMemoryPriceCatalog {
    components: DashMap<Uuid, PriceComponent>,
}

impl InMemoryPriceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_components(components: impl IntoIterator<Item = PriceComponent>) -> Self {
        let catalog = Self::new();
        for component in components {
            catalog.upsert(component);
        }
        catalog
    }

    /// Loads a JSON array of components.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::InternalError(format!("cannot read catalog {}: {}", path.display(), e))
        })?;
        let components: Vec<PriceComponent> = serde_json::from_str(&raw)?;
        info!(count = components.len(), path = %path.display(), "price catalog loaded");
        Ok(Self::with_components(components))
    }

    pub fn upsert(&self, component: PriceComponent) {
        self.components.insert(component.id, component);
    }

    /// Changes a live price. Existing orders keep their snapshot.
    pub fn set_price(&self, id: Uuid, price: i64) -> bool {
        match self.components.get_mut(&id) {
            Some(mut component) => {
                component.price = price;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PriceCatalog for InMemoryPriceCatalog {
    async fn components(&self, ids: &[Uuid]) -> Result<Vec<PriceComponent>, ServiceError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.components.get(id).map(|c| c.value().clone()))
            .collect())
    }

    async fn components_for_service(
        &self,
        service_id: Uuid,
    ) -> Result<Vec<PriceComponent>, ServiceError> {
        Ok(self
            .components
            .iter()
            .filter(|c| c.service_id == service_id)
            .map(|c| c.value().clone())
            .collect())
    }
}

/// Validates a selection and freezes its prices, in request order.
pub async fn resolve_selection(
    catalog: &dyn PriceCatalog,
    ids: &[Uuid],
) -> Result<Vec<SelectedItem>, ServiceError> {
    if ids.is_empty() {
        return Err(ServiceError::ValidationError(
            "at least one price component must be selected".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = ids.iter().find(|id| !seen.insert(**id)) {
        return Err(ServiceError::ValidationError(format!(
            "price component {} selected more than once",
            dup
        )));
    }

    let found = catalog.components(ids).await?;
    let mut selected = Vec::with_capacity(ids.len());
    for id in ids {
        let component = found.iter().find(|c| &c.id == id).ok_or_else(|| {
            ServiceError::ValidationError(format!("unknown price component {}", id))
        })?;
        selected.push(component);
    }

    let service_id = selected[0].service_id;
    if selected.iter().any(|c| c.service_id != service_id) {
        return Err(ServiceError::ValidationError(
            "selected price components belong to different services".to_string(),
        ));
    }

    let missing: Vec<String> = catalog
        .components_for_service(service_id)
        .await?
        .into_iter()
        .filter(|c| c.is_compulsory && !seen.contains(&c.id))
        .map(|c| c.name)
        .collect();
    if !missing.is_empty() {
        return Err(ServiceError::ValidationError(format!(
            "compulsory price components missing: {}",
            missing.join(", ")
        )));
    }

    let items: Vec<SelectedItem> = selected.into_iter().map(PriceComponent::snapshot).collect();
    if items.iter().map(|item| item.final_price).sum::<i64>() <= 0 {
        return Err(ServiceError::ValidationError(
            "order amount must be greater than zero".to_string(),
        ));
    }
    Ok(items)
}
