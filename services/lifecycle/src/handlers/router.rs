//! Attribute-based dispatch of metadata topic messages.
//!
//! The routing decision is a filter policy pair installed on the topic's
//! two subscriptions. A message reaches the metadata applier when its
//! `metadataType` attribute is one of [`RECOGNIZED_METADATA_TYPES`], and
//! reaches the status updater otherwise, including when the attribute is
//! missing. The two policies are complements, so every message lands on
//! exactly one path.

use crate::transport::{FilterPolicy, MessageAttributes};

/// Message attribute carrying the metadata field name
pub const METADATA_TYPE_ATTRIBUTE: &str = "metadataType";

/// Field names routed to the metadata applier. `name` and `Name` are both
/// accepted and stored as `Name`.
pub const RECOGNIZED_METADATA_TYPES: [&str; 4] = ["Caption", "Date", "name", "Name"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    MetadataApplier,
    StatusUpdater,
}

pub fn route(attributes: &MessageAttributes) -> Route {
    match attributes.get(METADATA_TYPE_ATTRIBUTE) {
        Some(value) if RECOGNIZED_METADATA_TYPES.contains(&value.as_str()) => {
            Route::MetadataApplier
        }
        _ => Route::StatusUpdater,
    }
}

/// Filter for the metadata applier's subscription
pub fn applier_filter() -> FilterPolicy {
    FilterPolicy::any_of(METADATA_TYPE_ATTRIBUTE, RECOGNIZED_METADATA_TYPES)
}

/// Filter for the review status updater's subscription
pub fn status_filter() -> FilterPolicy {
    FilterPolicy::none_of(METADATA_TYPE_ATTRIBUTE, RECOGNIZED_METADATA_TYPES)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_type(value: Option<&str>) -> MessageAttributes {
        let mut attributes = MessageAttributes::new();
        if let Some(value) = value {
            attributes.insert(METADATA_TYPE_ATTRIBUTE.to_string(), value.to_string());
        }
        attributes.insert("unrelated".to_string(), "Caption".to_string());
        attributes
    }

    #[test]
    fn test_route() {
        assert_eq!(route(&with_type(Some("Caption"))), Route::MetadataApplier);
        assert_eq!(route(&with_type(Some("name"))), Route::MetadataApplier);
        assert_eq!(route(&with_type(Some("Name"))), Route::MetadataApplier);
        assert_eq!(route(&with_type(Some("Date"))), Route::MetadataApplier);
        assert_eq!(route(&with_type(Some("caption"))), Route::StatusUpdater);
        assert_eq!(route(&with_type(Some("status"))), Route::StatusUpdater);
        assert_eq!(route(&with_type(Some(""))), Route::StatusUpdater);
        assert_eq!(route(&with_type(None)), Route::StatusUpdater);
    }

    #[test]
    fn test_filters_partition_every_message() {
        let applier = applier_filter();
        let status = status_filter();

        let candidates = [
            None,
            Some("Caption"),
            Some("Date"),
            Some("name"),
            Some("Name"),
            Some("NAME"),
            Some("date"),
            Some("status"),
            Some(""),
            Some(" Caption"),
        ];

        for candidate in candidates {
            let attributes = with_type(candidate);
            let to_applier = applier.matches(&attributes);
            let to_status = status.matches(&attributes);

            assert_ne!(to_applier, to_status, "candidate {candidate:?}");
            let expected = if to_applier {
                Route::MetadataApplier
            } else {
                Route::StatusUpdater
            };
            assert_eq!(route(&attributes), expected, "candidate {candidate:?}");
        }
    }
}
