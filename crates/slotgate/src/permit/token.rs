//! Permit identity and the opaque permit handed out by slot suppliers.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for an issued permit.
///
/// UUID v4 so ids minted on either side of the policy bridge never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermitId(uuid::Uuid);

impl PermitId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for PermitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PermitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One granted unit of capacity.
///
/// Suppliers may attach arbitrary data when they grant a permit and read it
/// back when the permit is marked used or released.
pub struct SlotSupplierPermit {
    id: PermitId,
    user_data: Option<Box<dyn Any + Send + Sync>>,
}

impl SlotSupplierPermit {
    pub fn new() -> Self {
        Self {
            id: PermitId::new(),
            user_data: None,
        }
    }

    pub fn with_data<T: Any + Send + Sync>(data: T) -> Self {
        Self {
            id: PermitId::new(),
            user_data: Some(Box::new(data)),
        }
    }

    pub(crate) fn from_parts(id: PermitId, user_data: Option<Box<dyn Any + Send + Sync>>) -> Self {
        Self { id, user_data }
    }

    pub fn id(&self) -> PermitId {
        self.id
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref()?.downcast_ref::<T>()
    }

    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut()?.downcast_mut::<T>()
    }

    pub fn has_user_data(&self) -> bool {
        self.user_data.is_some()
    }
}

impl Default for SlotSupplierPermit {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SlotSupplierPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotSupplierPermit")
            .field("id", &self.id)
            .field("has_user_data", &self.has_user_data())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_get_distinct_ids() {
        let a = SlotSupplierPermit::new();
        let b = SlotSupplierPermit::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn user_data_downcasts_to_original_type() {
        let mut permit = SlotSupplierPermit::with_data(42_u32);
        assert_eq!(permit.user_data::<u32>(), Some(&42));
        assert!(permit.user_data::<String>().is_none());

        *permit.user_data_mut::<u32>().unwrap() += 1;
        assert_eq!(permit.user_data::<u32>(), Some(&43));
    }

    #[test]
    fn permit_id_display_parses_back() {
        let id = PermitId::new();
        assert_eq!(PermitId::parse(&id.to_string()).unwrap(), id);
        assert!(PermitId::parse("not-a-uuid").is_err());
    }
}
