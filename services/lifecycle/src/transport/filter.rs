use super::MessageAttributes;

/// Subscription filter evaluated against a message's attributes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FilterPolicy {
    #[default]
    AcceptAll,
    /// Attribute present with one of the values
    AnyOf {
        attribute: String,
        values: Vec<String>,
    },
    /// Attribute absent, or present with none of the values
    NoneOf {
        attribute: String,
        values: Vec<String>,
    },
}

impl FilterPolicy {
    pub fn any_of<I, S>(attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FilterPolicy::AnyOf {
            attribute: attribute.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn none_of<I, S>(attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FilterPolicy::NoneOf {
            attribute: attribute.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, attributes: &MessageAttributes) -> bool {
        match self {
            FilterPolicy::AcceptAll => true,
            FilterPolicy::AnyOf { attribute, values } => attributes
                .get(attribute)
                .is_some_and(|v| values.iter().any(|allowed| allowed == v)),
            FilterPolicy::NoneOf { attribute, values } => attributes
                .get(attribute)
                .map_or(true, |v| values.iter().all(|denied| denied != v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> MessageAttributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_any_of_requires_attribute() {
        let filter = FilterPolicy::any_of("metadataType", ["Caption", "Date"]);

        assert!(filter.matches(&attrs(&[("metadataType", "Caption")])));
        assert!(!filter.matches(&attrs(&[("metadataType", "caption")])));
        assert!(!filter.matches(&attrs(&[])));
    }

    #[test]
    fn test_none_of_accepts_missing_attribute() {
        let filter = FilterPolicy::none_of("metadataType", ["Caption", "Date"]);

        assert!(filter.matches(&attrs(&[])));
        assert!(filter.matches(&attrs(&[("metadataType", "Other")])));
        assert!(!filter.matches(&attrs(&[("metadataType", "Date")])));
    }

    #[test]
    fn test_accept_all() {
        assert!(FilterPolicy::AcceptAll.matches(&attrs(&[])));
        assert!(FilterPolicy::default().matches(&attrs(&[("any", "thing")])));
    }
}
