//! Data sources feeding memory construction.
//!
//! The rehearsal core never owns a dataset pipeline; it pulls per-class
//! images through [`ClassDataSource`] and hands training an appendant
//! `(data, labels)` pair back through [`AppendantDataset`].

use crate::tensor::ImageTensor;

/// Provider of the full image set for one class.
pub trait ClassDataSource {
    fn class_images(&self, class_id: usize) -> Vec<ImageTensor>;
}

/// Class data held directly in memory, indexed by class id.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataSource {
    classes: Vec<Vec<ImageTensor>>,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_class(&mut self, images: Vec<ImageTensor>) -> usize {
        self.classes.push(images);
        self.classes.len() - 1
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }
}

impl ClassDataSource for InMemoryDataSource {
    fn class_images(&self, class_id: usize) -> Vec<ImageTensor> {
        self.classes
            .get(class_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// A class range merged with an appendant `(data, labels)` pair.
///
/// An empty class range with a nonempty appendant iterates exemplars only,
/// which is how rehearsal-only passes are built.
pub struct AppendantDataset<'a> {
    source: Option<(&'a dyn ClassDataSource, std::ops::Range<usize>)>,
    appendant: Vec<(ImageTensor, usize)>,
}

impl<'a> AppendantDataset<'a> {
    /// Dataset over `classes` from `source`, extended by the appendant pair.
    pub fn new(
        source: &'a dyn ClassDataSource,
        classes: std::ops::Range<usize>,
        appendant_data: Vec<ImageTensor>,
        appendant_labels: Vec<usize>,
    ) -> Self {
        Self {
            source: Some((source, classes)),
            appendant: appendant_data.into_iter().zip(appendant_labels).collect(),
        }
    }

    /// Dataset holding only the appendant pair.
    pub fn exemplars_only(appendant_data: Vec<ImageTensor>, appendant_labels: Vec<usize>) -> Self {
        Self {
            source: None,
            appendant: appendant_data.into_iter().zip(appendant_labels).collect(),
        }
    }

    /// Iterates `(index, image, label)` over class data then the appendant.
    pub fn iter(&self) -> impl Iterator<Item = (usize, ImageTensor, usize)> + '_ {
        let from_classes: Vec<(ImageTensor, usize)> = match &self.source {
            Some((source, classes)) => classes
                .clone()
                .flat_map(|class_id| {
                    source
                        .class_images(class_id)
                        .into_iter()
                        .map(move |image| (image, class_id))
                })
                .collect(),
            None => Vec::new(),
        };

        from_classes
            .into_iter()
            .chain(self.appendant.iter().cloned())
            .enumerate()
            .map(|(index, (image, label))| (index, image, label))
    }

    pub fn len(&self) -> usize {
        let class_len = match &self.source {
            Some((source, classes)) => classes
                .clone()
                .map(|class_id| source.class_images(class_id).len())
                .sum(),
            None => 0,
        };
        class_len + self.appendant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_with(classes: &[usize]) -> InMemoryDataSource {
        let mut source = InMemoryDataSource::new();
        for (class_id, &count) in classes.iter().enumerate() {
            let images = (0..count)
                .map(|i| ImageTensor::from_seed((class_id * 100 + i) as u64, 4, 4, 1))
                .collect();
            source.push_class(images);
        }
        source
    }

    #[test]
    fn test_in_memory_source_lookup() {
        let source = source_with(&[3, 5]);
        assert_eq!(source.class_images(0).len(), 3);
        assert_eq!(source.class_images(1).len(), 5);
        assert!(source.class_images(9).is_empty());
    }

    #[test]
    fn test_appendant_follows_class_data() {
        let source = source_with(&[2, 2]);
        let exemplars = vec![ImageTensor::from_seed(900, 4, 4, 1)];
        let dataset = AppendantDataset::new(&source, 0..2, exemplars, vec![7]);

        let items: Vec<_> = dataset.iter().collect();
        assert_eq!(items.len(), 5);
        assert_eq!(items[0].2, 0);
        assert_eq!(items[2].2, 1);
        assert_eq!(items[4].2, 7);
        assert!(items.iter().enumerate().all(|(i, item)| item.0 == i));
    }

    #[test]
    fn test_exemplars_only_dataset() {
        let data: Vec<ImageTensor> = (0..4)
            .map(|i| ImageTensor::from_seed(i, 4, 4, 1))
            .collect();
        let labels = vec![0, 0, 1, 1];
        let dataset = AppendantDataset::exemplars_only(data, labels.clone());

        assert_eq!(dataset.len(), 4);
        let collected_labels: Vec<usize> = dataset.iter().map(|(_, _, label)| label).collect();
        assert_eq!(collected_labels, labels);
    }
}
