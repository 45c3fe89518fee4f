use fxhash::FxHashMap;
use serde::Serialize;

use crate::element::{FieldValue, InfoElementWithValue};

/// Kind of the single set carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SetType {
    Template,
    Data,
}

/// One template or data set: a run of records sharing a template id.
#[derive(Debug, Clone, Serialize)]
pub struct Set {
    pub set_type: SetType,
    pub template_id: u16,
    pub records: Vec<Record>,
}

impl Set {
    pub fn new(set_type: SetType, template_id: u16) -> Self {
        Self {
            set_type,
            template_id,
            records: Vec::new(),
        }
    }

    pub fn add_record(&mut self, record: Record) {
        self.records.push(record);
    }
}

/// A decoded IPFIX message as handed over by the upstream decoder: header
/// fields plus one set. Transport framing is gone by the time a message
/// reaches the aggregator, which is why the export address travels here in
/// textual form.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub version: u16,
    pub length: u16,
    pub sequence_number: u32,
    pub observation_domain_id: u32,
    /// Export time from the message header, seconds since the UNIX epoch.
    pub export_time: u32,
    /// Address of the exporting process, e.g. "127.0.0.1" or "::1".
    pub export_address: String,
    pub set: Set,
}

/// An ordered collection of elements with values. Merge code looks elements
/// up by name on every record, so a name index is kept alongside the
/// ordered vector. The first occurrence of a name wins the index.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Record {
    elements: Vec<InfoElementWithValue>,
    #[serde(skip)]
    index: FxHashMap<String, usize>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element. Keeps record order; duplicate names stay in the
    /// vector but do not displace the original in the index.
    pub fn push(&mut self, element: InfoElementWithValue) {
        let name = element.element.name.clone();
        self.elements.push(element);
        let position = self.elements.len() - 1;
        self.index.entry(name).or_insert(position);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&InfoElementWithValue> {
        self.index.get(name).map(|&i| &self.elements[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut InfoElementWithValue> {
        match self.index.get(name) {
            Some(&i) => Some(&mut self.elements[i]),
            None => None,
        }
    }

    pub fn elements(&self) -> &[InfoElementWithValue] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Value of the named element, if present and carrying one.
    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.get(name).and_then(|e| e.value.as_ref())
    }

    /// String value of the named element, or "" when the element is absent
    /// or valueless. Side detection treats absence and emptiness alike.
    pub fn str_value(&self, name: &str) -> &str {
        self.value(name).and_then(FieldValue::as_str).unwrap_or("")
    }

    /// Unsigned value of the named element, widened to u64.
    pub fn unsigned_value(&self, name: &str) -> Option<u64> {
        self.value(name).and_then(FieldValue::as_u64)
    }
}

impl FromIterator<InfoElementWithValue> for Record {
    fn from_iter<I: IntoIterator<Item = InfoElementWithValue>>(iter: I) -> Self {
        let mut record = Record::new();
        for element in iter {
            record.push(element);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{DataType, InfoElement};

    fn string_element(name: &str, value: &str) -> InfoElementWithValue {
        InfoElementWithValue::new(
            InfoElement::new(name, 101, 56506, DataType::String, 0xffff),
            FieldValue::String(value.to_string()),
        )
    }

    #[test]
    fn test_record_lookup_by_name() {
        let mut record = Record::new();
        record.push(string_element("sourcePodName", "pod1"));
        record.push(string_element("destinationPodName", ""));

        assert_eq!(record.len(), 2);
        assert!(record.contains("sourcePodName"));
        assert!(!record.contains("sourceNodeName"));
        assert_eq!(record.str_value("sourcePodName"), "pod1");
        assert_eq!(record.str_value("destinationPodName"), "");
        assert_eq!(record.str_value("sourceNodeName"), "");
    }

    #[test]
    fn test_record_preserves_element_order() {
        let mut record = Record::new();
        record.push(string_element("a", "1"));
        record.push(string_element("b", "2"));
        record.push(string_element("c", "3"));

        let names: Vec<&str> = record
            .elements()
            .iter()
            .map(|e| e.element.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_name_keeps_first_in_index() {
        let mut record = Record::new();
        record.push(string_element("sourcePodName", "pod1"));
        record.push(string_element("sourcePodName", "pod2"));

        assert_eq!(record.len(), 2);
        assert_eq!(record.str_value("sourcePodName"), "pod1");
    }

    #[test]
    fn test_get_mut_updates_value() {
        let mut record = Record::new();
        record.push(string_element("sourcePodName", ""));
        if let Some(element) = record.get_mut("sourcePodName") {
            element.value = Some(FieldValue::String("pod1".to_string()));
        }
        assert_eq!(record.str_value("sourcePodName"), "pod1");
    }
}
