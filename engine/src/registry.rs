//! Table mapping registry.
//!
//! Mappings are keyed by `"{database}.{table}"` using the canonical database
//! name of the source system. Lookups tolerate naming drift between the
//! capture tooling and the configuration by trying, in order:
//!
//! 1. `"{canonical database of the resolved system}.{table}"`
//! 2. `"{reported source system}.{table}"`
//! 3. `"{table}"`

use crate::{
    conflict::{ResolverRegistry, Strategy},
    error::Result,
    mapping::StrategyKind,
    transform::LookupTables,
    ColumnMapping, ConflictResolutionConfig, Error, SemanticType, System, TableMapping,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Names by which each system may be referred to.
#[derive(Debug, Clone)]
pub struct SystemNames {
    canonical_a: String,
    canonical_b: String,
    aliases: HashMap<String, System>,
}

impl Default for SystemNames {
    fn default() -> Self {
        let mut aliases = HashMap::new();
        for name in ["a", "system-a", "mysql", "legacy_db"] {
            aliases.insert(name.to_string(), System::A);
        }
        for name in ["b", "system-b", "postgres", "postgresql", "new_db"] {
            aliases.insert(name.to_string(), System::B);
        }
        Self {
            canonical_a: "legacy_db".to_string(),
            canonical_b: "new_db".to_string(),
            aliases,
        }
    }
}

impl SystemNames {
    /// Use `database` as the canonical name of `system`. The name also becomes
    /// an alias.
    pub fn with_database(mut self, system: System, database: impl Into<String>) -> Self {
        let database = database.into();
        self.aliases.insert(database.to_ascii_lowercase(), system);
        match system {
            System::A => self.canonical_a = database,
            System::B => self.canonical_b = database,
        }
        self
    }

    /// Add an extra alias, such as a connector name.
    pub fn with_alias(mut self, system: System, alias: impl AsRef<str>) -> Self {
        self.aliases.insert(alias.as_ref().to_ascii_lowercase(), system);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<System> {
        self.aliases.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn canonical(&self, system: System) -> &str {
        match system {
            System::A => &self.canonical_a,
            System::B => &self.canonical_b,
        }
    }
}

/// On-disk mapping document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingDocument {
    pub mappings: Vec<TableMapping>,
    #[serde(default, skip_serializing_if = "LookupTables::is_empty")]
    pub lookups: LookupTables,
}

impl MappingDocument {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::InvalidDocument(e.to_string()))
    }

    /// Users, products and orders between `legacy_db` and `new_db`.
    pub fn builtin() -> Self {
        let users = TableMapping::new(System::A, "users", "users")
            .with_column(ColumnMapping::new("id", "id", SemanticType::Integer).not_null())
            .column("username", "username", SemanticType::Text)
            .column("email", "email", SemanticType::Text)
            .column("password_hash", "password_hash", SemanticType::Text)
            .column("created_date", "created_at", SemanticType::Timestamp)
            .column("modified_date", "updated_at", SemanticType::Timestamp)
            .column("is_active", "is_active", SemanticType::Boolean)
            .column("user_type", "role", SemanticType::Text)
            .with_conflict_resolution(ConflictResolutionConfig::timestamp("updated_at"));

        let products = TableMapping::new(System::A, "products", "products")
            .with_column(ColumnMapping::new("product_id", "id", SemanticType::Integer).not_null())
            .column("product_name", "name", SemanticType::Text)
            .column("product_desc", "description", SemanticType::Text)
            .column("price", "price", SemanticType::Decimal)
            .column("stock_qty", "stock_quantity", SemanticType::Integer)
            .column("category_id", "category_id", SemanticType::Integer)
            .column("created_time", "created_at", SemanticType::Timestamp)
            .column("updated_time", "updated_at", SemanticType::Timestamp)
            .column("product_status", "status", SemanticType::Text)
            .column("product_data", "metadata", SemanticType::Json)
            .skip("internal_notes")
            .skip("legacy_code");

        let orders = TableMapping::new(System::A, "orders", "orders")
            .with_column(ColumnMapping::new("order_id", "id", SemanticType::Integer).not_null())
            .column("customer_id", "user_id", SemanticType::Integer)
            .column("order_date", "created_at", SemanticType::Timestamp)
            .column("total_amount", "total", SemanticType::Decimal)
            .column("order_status", "status", SemanticType::Text)
            .column("shipping_addr", "shipping_address", SemanticType::Json)
            .column("billing_addr", "billing_address", SemanticType::Json)
            .column("version", "version", SemanticType::Integer)
            .with_conflict_resolution(ConflictResolutionConfig::version("version"));

        Self {
            mappings: vec![users, products, orders],
            lookups: LookupTables::new(),
        }
    }
}

/// Resolves `(source system, table)` to a [`TableMapping`].
///
/// Read-only once startup has finished; share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct MappingRegistry {
    names: SystemNames,
    mappings: HashMap<String, TableMapping>,
    lookups: LookupTables,
}

impl MappingRegistry {
    pub fn new(names: SystemNames) -> Self {
        Self {
            names,
            mappings: HashMap::new(),
            lookups: LookupTables::new(),
        }
    }

    /// Register every mapping of a document. Reverse mappings are not derived.
    pub fn from_document(document: MappingDocument, names: SystemNames) -> Result<Self> {
        let mut registry = Self::new(names);
        registry.lookups = document.lookups;
        for mapping in document.mappings {
            registry.register_mapping(mapping)?;
        }
        Ok(registry)
    }

    pub fn names(&self) -> &SystemNames {
        &self.names
    }

    pub fn lookups(&self) -> &LookupTables {
        &self.lookups
    }

    /// Registry key of a mapping whose source is `table` on `system`.
    pub fn key_for(&self, system: System, table: &str) -> String {
        format!("{}.{}", self.names.canonical(system), table)
    }

    /// Validate and insert `mapping`. An existing mapping under the same key is
    /// replaced and returned.
    pub fn register_mapping(&mut self, mapping: TableMapping) -> Result<Option<TableMapping>> {
        let key = self.key_for(mapping.source.system, &mapping.source.table);
        self.register_as(key, mapping)
    }

    /// Register under an explicit key, bypassing the canonical naming.
    pub fn register_as(
        &mut self,
        key: impl Into<String>,
        mapping: TableMapping,
    ) -> Result<Option<TableMapping>> {
        mapping.validate(&self.lookups)?;
        let key = key.into();
        let previous = self.mappings.insert(key.clone(), mapping);
        if previous.is_some() {
            warn!(key = %key, "mapping replaced");
        } else {
            debug!(key = %key, "mapping registered");
        }
        Ok(previous)
    }

    pub fn remove_mapping(&mut self, key: &str) -> Option<TableMapping> {
        self.mappings.remove(key)
    }

    /// Find the mapping for an event on `table` reported by `source_system`.
    ///
    /// `None` is a configuration gap, not an error.
    pub fn get_mapping(&self, source_system: &str, table: &str) -> Option<&TableMapping> {
        if let Some(system) = self.names.resolve(source_system) {
            if let Some(mapping) = self.mappings.get(&self.key_for(system, table)) {
                return Some(mapping);
            }
        }
        self.mappings
            .get(&format!("{source_system}.{table}"))
            .or_else(|| self.mappings.get(table))
    }

    /// Derive reverse mappings for every bidirectional mapping that has no
    /// manually registered counterpart. Returns the keys that were added.
    ///
    /// Nothing is registered if any mapping cannot be reversed.
    pub fn derive_reverse_mappings(&mut self) -> Result<Vec<String>> {
        let mut keys: Vec<&String> = self.mappings.keys().collect();
        keys.sort();

        let mut derived: BTreeMap<String, (String, TableMapping)> = BTreeMap::new();
        let mut failures = Vec::new();

        for key in keys {
            let mapping = &self.mappings[key];
            if !mapping.bidirectional {
                continue;
            }

            let reverse_key = self.key_for(mapping.target.system, &mapping.target.table);
            if self.mappings.contains_key(&reverse_key) {
                debug!(key = %key, reverse = %reverse_key, "reverse registered manually");
                continue;
            }

            match mapping.reverse() {
                Ok(reverse) => {
                    if let Some((other, _)) = derived.get(&reverse_key) {
                        return Err(Error::InvalidMapping {
                            mapping: mapping.to_string(),
                            reason: format!("reverse collides with the reverse of {other}"),
                        });
                    }
                    derived.insert(reverse_key, (key.clone(), reverse));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "cannot derive reverse mapping");
                    failures.push(e);
                }
            }
        }

        if let Some(first) = failures.into_iter().next() {
            return Err(first);
        }

        let mut added = Vec::with_capacity(derived.len());
        for (reverse_key, (_, reverse)) in derived {
            reverse.validate(&self.lookups)?;
            info!(key = %reverse_key, mapping = %reverse, "derived reverse mapping");
            self.mappings.insert(reverse_key.clone(), reverse);
            added.push(reverse_key);
        }
        Ok(added)
    }

    /// Check that every custom strategy names a registered resolver and that
    /// every mapping has a usable strategy.
    pub fn validate_strategies(
        &self,
        default: StrategyKind,
        resolvers: &ResolverRegistry,
    ) -> Result<()> {
        for mapping in self.mappings.values() {
            if let Strategy::Custom { resolver } = mapping.strategy(default)? {
                if !resolvers.contains(&resolver) {
                    return Err(Error::UnknownResolver(resolver));
                }
            }
        }
        Ok(())
    }

    pub fn mappings(&self) -> impl Iterator<Item = (&str, &TableMapping)> {
        self.mappings.iter().map(|(k, m)| (k.as_str(), m))
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
