use std::collections::HashMap;
use std::sync::Arc;

use roxmltree::{Document, Node};

use crate::storage::FieldStore;

use super::{HandlerOutcome, PayloadHandler, ProcessingError};

pub const CHANGE_SET_KIND: &str = "field-value-change-set";
pub const FIELD_VALUE_KEY_PREFIX: &str = "FFV:";
pub const VALUE_STRING_FIELD: &str = "ValueString";
pub const PROCESSED_RESPONSE: &str = "Audit Message processed!";

const TRACKING_TYPE: &str = "TrackingType";
const INSERTED: &str = "Inserted";
const DELETED: &str = "Deleted";
const FORM_FIELD_VALUES: &str = "FormFieldValues";
const FIELD_VALUE: &str = "Ffv";
const ID_ATTRIBUTE: &str = "id";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldValue {
    pub id: String,
    pub value_string: String,
}

impl FieldValue {
    pub fn store_key(&self) -> String {
        format!("{FIELD_VALUE_KEY_PREFIX}{}", self.id)
    }
}

/// Before/after images of an audited change. `deleted` is carried along but
/// no strategy writes it yet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub tracking_type: String,
    pub inserted: Vec<FieldValue>,
    pub deleted: Vec<FieldValue>,
}

/// Behaviour for one `TrackingType` value.
pub trait TrackingStrategy: Send + Sync {
    fn extract(&self, root: Node<'_, '_>) -> Result<ChangeSet, ProcessingError>;

    /// Applies side effects and returns the number of store writes.
    fn apply(&self, change_set: &ChangeSet, store: &dyn FieldStore) -> Result<usize, ProcessingError>;
}

pub struct UpdateStrategy;

impl TrackingStrategy for UpdateStrategy {
    fn extract(&self, root: Node<'_, '_>) -> Result<ChangeSet, ProcessingError> {
        Ok(ChangeSet {
            tracking_type: "UPDATE".to_owned(),
            inserted: field_values(child_element(root, INSERTED)?)?,
            deleted: field_values(child_element(root, DELETED)?)?,
        })
    }

    fn apply(&self, change_set: &ChangeSet, store: &dyn FieldStore) -> Result<usize, ProcessingError> {
        for field_value in &change_set.inserted {
            let key = field_value.store_key();
            store
                .set_field(&key, VALUE_STRING_FIELD, &field_value.value_string)
                .map_err(|source| ProcessingError::SinkWrite { key, source })?;
        }
        Ok(change_set.inserted.len())
    }
}

pub struct ChangeSetHandler {
    store: Arc<dyn FieldStore>,
    strategies: HashMap<String, Box<dyn TrackingStrategy>>,
}

impl ChangeSetHandler {
    /// Handler with the `UPDATE` strategy registered.
    pub fn new(store: Arc<dyn FieldStore>) -> Self {
        Self {
            store,
            strategies: HashMap::new(),
        }
        .with_strategy("UPDATE", Box::new(UpdateStrategy))
    }

    pub fn with_strategy(
        mut self,
        tracking_type: impl Into<String>,
        strategy: Box<dyn TrackingStrategy>,
    ) -> Self {
        self.strategies.insert(tracking_type.into(), strategy);
        self
    }

    pub fn parse(&self, document: &Document<'_>) -> Result<(ChangeSet, &dyn TrackingStrategy), ProcessingError> {
        let root = document.root_element();
        // Matched verbatim: " UPDATE " is not UPDATE.
        let tracking_type = element_text(child_element(root, TRACKING_TYPE)?);

        let strategy = self
            .strategies
            .get(tracking_type.as_str())
            .ok_or(ProcessingError::UnsupportedTrackingType { tracking_type })?;
        Ok((strategy.extract(root)?, strategy.as_ref()))
    }
}

impl PayloadHandler for ChangeSetHandler {
    fn kind(&self) -> &'static str {
        CHANGE_SET_KIND
    }

    fn handle(&self, document: &Document<'_>) -> Result<HandlerOutcome, ProcessingError> {
        let (change_set, strategy) = self.parse(document)?;
        let writes = strategy.apply(&change_set, self.store.as_ref())?;

        Ok(HandlerOutcome {
            kind: CHANGE_SET_KIND,
            response: PROCESSED_RESPONSE.to_owned(),
            writes,
        })
    }
}

fn child_element<'a, 'input>(
    parent: Node<'a, 'input>,
    name: &str,
) -> Result<Node<'a, 'input>, ProcessingError> {
    parent
        .children()
        .find(|node| node.is_element() && node.has_tag_name(name))
        .ok_or_else(|| {
            ProcessingError::malformed(format!(
                "missing <{name}> under <{}>",
                parent.tag_name().name()
            ))
        })
}

/// Concatenated text of every descendant text node.
fn element_text(node: Node<'_, '_>) -> String {
    node.descendants()
        .filter(|child| child.is_text())
        .filter_map(|child| child.text())
        .collect()
}

fn field_values(side: Node<'_, '_>) -> Result<Vec<FieldValue>, ProcessingError> {
    child_element(side, FORM_FIELD_VALUES)?
        .descendants()
        .filter(|node| node.is_element() && node.has_tag_name(FIELD_VALUE))
        .map(|ffv| {
            let id = ffv.attribute(ID_ATTRIBUTE).ok_or_else(|| {
                ProcessingError::malformed(format!(
                    "<{FIELD_VALUE}> under <{}> has no '{ID_ATTRIBUTE}' attribute",
                    side.tag_name().name()
                ))
            })?;
            Ok(FieldValue {
                id: id.to_owned(),
                value_string: element_text(child_element(ffv, VALUE_STRING_FIELD)?),
            })
        })
        .collect()
}
