use ndarray::Array3;
use std::fmt;

/// Class identifier derived from a patient number.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(String);

impl Label {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Leading `prefix_len` characters of the patient number.
    ///
    /// `A0001` yields `A` with the default prefix length of 1. Returns `None`
    /// for an empty patient number.
    pub fn from_patient(patient: &str, prefix_len: usize) -> Option<Self> {
        let label: String = patient.chars().take(prefix_len.max(1)).collect();
        (!label.is_empty()).then_some(Self(label))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A paired CT/PET volume with its class label.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Store key: the patient number, or a generated id for synthetic samples.
    pub id: String,
    pub ct: Array3<f32>,
    pub pet: Array3<f32>,
    pub label: Label,
    pub synthetic: bool,
}
