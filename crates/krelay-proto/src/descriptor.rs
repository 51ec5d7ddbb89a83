//! Agent capability descriptor
//!
//! An agent advertises the set of services it can serve on every new
//! tunnel. The descriptor is immutable for the lifetime of that tunnel and
//! drives tunnel matching on the control plane.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// A single method of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
}

/// A service with an ordered list of methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub methods: Vec<Method>,
}

impl Service {
    pub fn new(name: impl Into<String>, methods: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            name: name.into(),
            methods: methods
                .into_iter()
                .map(|m| Method { name: m.to_string() })
                .collect(),
        }
    }
}

/// The set of (service, method) pairs an agent can serve.
///
/// Treated as an unordered set of services; validated on receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub services: Vec<Service>,
}

/// Descriptor validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("service name must not be empty")]
    EmptyServiceName,

    #[error("method name must not be empty in service {service}")]
    EmptyMethodName { service: String },

    #[error("duplicate method {method} in service {service}")]
    DuplicateMethod { service: String, method: String },
}

impl AgentDescriptor {
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }

    /// Validate names: non-empty service and method names, method names
    /// unique within their service.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for service in &self.services {
            if service.name.is_empty() {
                return Err(ValidationError::EmptyServiceName);
            }
            let mut seen = HashSet::with_capacity(service.methods.len());
            for method in &service.methods {
                if method.name.is_empty() {
                    return Err(ValidationError::EmptyMethodName {
                        service: service.name.clone(),
                    });
                }
                if !seen.insert(method.name.as_str()) {
                    return Err(ValidationError::DuplicateMethod {
                        service: service.name.clone(),
                        method: method.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Whether this descriptor advertises the given service and method.
    pub fn supports_service_and_method(&self, service: &str, method: &str) -> bool {
        self.services
            .iter()
            .filter(|s| s.name == service)
            .any(|s| s.methods.iter().any(|m| m.name == method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_service_and_method() {
        let descriptor = AgentDescriptor::new(vec![
            Service::new("gitops", ["GetObjectsToSynchronize"]),
            Service::new("starboard", ["Scan", "Report"]),
        ]);

        assert!(descriptor.supports_service_and_method("gitops", "GetObjectsToSynchronize"));
        assert!(descriptor.supports_service_and_method("starboard", "Report"));
        assert!(!descriptor.supports_service_and_method("gitops", "Scan"));
        assert!(!descriptor.supports_service_and_method("missing", "Scan"));
    }

    #[test]
    fn test_validate_ok() {
        let descriptor = AgentDescriptor::new(vec![Service::new("s", ["a", "b"])]);
        assert!(descriptor.validate().is_ok());
        assert!(AgentDescriptor::default().validate().is_ok());
    }

    #[test]
    fn test_validate_empty_service_name() {
        let descriptor = AgentDescriptor::new(vec![Service::new("", ["a"])]);
        assert_eq!(descriptor.validate(), Err(ValidationError::EmptyServiceName));
    }

    #[test]
    fn test_validate_empty_method_name() {
        let descriptor = AgentDescriptor::new(vec![Service::new("s", [""])]);
        assert_eq!(
            descriptor.validate(),
            Err(ValidationError::EmptyMethodName {
                service: "s".to_string()
            })
        );
    }

    #[test]
    fn test_validate_duplicate_method() {
        let descriptor = AgentDescriptor::new(vec![Service::new("s", ["a", "a"])]);
        assert_eq!(
            descriptor.validate(),
            Err(ValidationError::DuplicateMethod {
                service: "s".to_string(),
                method: "a".to_string()
            })
        );
    }

    #[test]
    fn test_duplicate_method_across_services_is_fine() {
        let descriptor =
            AgentDescriptor::new(vec![Service::new("s1", ["a"]), Service::new("s2", ["a"])]);
        assert!(descriptor.validate().is_ok());
    }

    #[test]
    fn test_descriptor_json_round_trip() {
        let descriptor = AgentDescriptor::new(vec![Service::new("gitops", ["Sync", "Status"])]);
        let json = serde_json::to_string(&descriptor).unwrap();
        let back: AgentDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
    }
}
