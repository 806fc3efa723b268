//! Property sets attached to packets.
//!
//! A [`DistributedPropertySet`] answers lookups from an ordered list of
//! satellite sets before falling back to its owner. The first satellite that
//! supports a key wins, so a satellite added later never shadows an earlier one.

use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Property values are untyped JSON values.
pub type PropertyValue = Value;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropertyError {
    #[error("Property '{0}' is read-only")]
    ReadOnly(String),

    #[error("Property '{key}' expects a {expected} value")]
    InvalidType { key: String, expected: &'static str },
}

/// A keyed set of properties.
pub trait PropertySet {
    /// Whether this set owns `key`.
    fn supports(&self, key: &str) -> bool;

    fn get(&self, key: &str) -> Option<PropertyValue>;

    /// Store a value. Returns the previous one.
    fn put(&mut self, key: &str, value: PropertyValue) -> Result<Option<PropertyValue>, PropertyError>;

    fn remove(&mut self, key: &str) -> Result<Option<PropertyValue>, PropertyError>;

    /// Keys that currently hold a value.
    fn keys(&self) -> Vec<String>;
}

/// A property set that can be attached to a [`DistributedPropertySet`].
pub trait Satellite: PropertySet + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn clone_satellite(&self) -> Box<dyn Satellite>;
}

/// A free-form property map; supports every key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapPropertySet {
    values: BTreeMap<String, PropertyValue>,
}

impl MapPropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl PropertySet for MapPropertySet {
    fn supports(&self, _key: &str) -> bool {
        true
    }

    fn get(&self, key: &str) -> Option<PropertyValue> {
        self.values.get(key).cloned()
    }

    fn put(&mut self, key: &str, value: PropertyValue) -> Result<Option<PropertyValue>, PropertyError> {
        Ok(self.values.insert(key.to_string(), value))
    }

    fn remove(&mut self, key: &str) -> Result<Option<PropertyValue>, PropertyError> {
        Ok(self.values.remove(key))
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

/// Owner plus an ordered list of satellites.
pub struct DistributedPropertySet<O> {
    owner: O,
    satellites: Vec<Box<dyn Satellite>>,
}

impl<O: PropertySet> DistributedPropertySet<O> {
    pub fn new(owner: O) -> Self {
        Self {
            owner,
            satellites: Vec::new(),
        }
    }

    pub fn owner(&self) -> &O {
        &self.owner
    }

    pub fn owner_mut(&mut self) -> &mut O {
        &mut self.owner
    }

    /// Attach a satellite after the existing ones.
    pub fn add_satellite<S: Satellite>(&mut self, satellite: S) {
        self.satellites.push(Box::new(satellite));
    }

    pub fn get_satellite<S: Satellite>(&self) -> Option<&S> {
        self.satellites
            .iter()
            .find_map(|s| s.as_any().downcast_ref::<S>())
    }

    pub fn get_satellite_mut<S: Satellite>(&mut self) -> Option<&mut S> {
        self.satellites
            .iter_mut()
            .find_map(|s| s.as_any_mut().downcast_mut::<S>())
    }

    /// Detach the first satellite of type `S`.
    pub fn remove_satellite<S: Satellite>(&mut self) -> Option<Box<dyn Satellite>> {
        let index = self
            .satellites
            .iter()
            .position(|s| s.as_any().is::<S>())?;
        Some(self.satellites.remove(index))
    }

    pub fn satellite_count(&self) -> usize {
        self.satellites.len()
    }

    fn owner_of(&self, key: &str) -> Option<usize> {
        self.satellites.iter().position(|s| s.supports(key))
    }
}

impl<O: PropertySet> PropertySet for DistributedPropertySet<O> {
    fn supports(&self, key: &str) -> bool {
        self.owner_of(key).is_some() || self.owner.supports(key)
    }

    fn get(&self, key: &str) -> Option<PropertyValue> {
        match self.owner_of(key) {
            Some(i) => self.satellites[i].get(key),
            None => self.owner.get(key),
        }
    }

    fn put(&mut self, key: &str, value: PropertyValue) -> Result<Option<PropertyValue>, PropertyError> {
        match self.owner_of(key) {
            Some(i) => self.satellites[i].put(key, value),
            None => self.owner.put(key, value),
        }
    }

    fn remove(&mut self, key: &str) -> Result<Option<PropertyValue>, PropertyError> {
        match self.owner_of(key) {
            Some(i) => self.satellites[i].remove(key),
            None => self.owner.remove(key),
        }
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        let sources = self
            .satellites
            .iter()
            .map(|s| s.keys())
            .chain(std::iter::once(self.owner.keys()));
        for key in sources.flatten() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

impl<O: Clone> Clone for DistributedPropertySet<O> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner.clone(),
            satellites: self.satellites.iter().map(|s| s.clone_satellite()).collect(),
        }
    }
}

impl<O: fmt::Debug> fmt::Debug for DistributedPropertySet<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedPropertySet")
            .field("owner", &self.owner)
            .field("satellites", &self.satellites.len())
            .finish()
    }
}
