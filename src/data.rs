//! Session datasets, padding and mini-batch slicing.
//!
//! A session is the ordered list of item ids a user interacted with; the
//! model predicts the next id (the *target*). Item id 0 is reserved for
//! padding, so every real id and every target is at least 1.
//!
//! ```text
//! sessions   [[3, 7], [5, 5, 9]]       targets [9, 2]
//! inputs     [[3, 7, 0], [5, 5, 9]]    (right-padded to len_max = 3)
//! mask       [[1, 1, 0], [1, 1, 1]]
//! ```

use std::collections::HashMap;
use std::path::Path;

use rand::seq::{index, SliceRandom};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{check_dim, Error, Result};

/// Item identifier. 0 is the padding sentinel.
pub type ItemId = u32;

/// Padding value for item sequences.
pub const PADDING: ItemId = 0;

/// Share of eligible sessions that receive an augmented copy.
const AUGMENT_FRACTION: f64 = 0.8;

/// On-disk form of a session partition.
///
/// ```json
/// {"sessions": [[1, 2, 3], [4, 5]], "targets": [4, 6]}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSessions {
    pub sessions: Vec<Vec<ItemId>>,
    pub targets: Vec<ItemId>,
}

/// Right-pad `sessions` with [`PADDING`] to `len_max` and derive the masks.
pub fn pad_sessions(sessions: &[Vec<ItemId>], len_max: usize) -> (Vec<Vec<ItemId>>, Vec<Vec<u8>>) {
    let mut inputs = Vec::with_capacity(sessions.len());
    let mut masks = Vec::with_capacity(sessions.len());
    for session in sessions {
        let len = session.len().min(len_max);
        let mut padded = session[..len].to_vec();
        padded.resize(len_max, PADDING);
        let mut mask = vec![1u8; len];
        mask.resize(len_max, 0);
        inputs.push(padded);
        masks.push(mask);
    }
    (inputs, masks)
}

fn validate_session(row: usize, session: &[ItemId]) -> Result<()> {
    if session.is_empty() {
        return Err(Error::InvalidSession(format!("session {row} is empty")));
    }
    if let Some(pos) = session.iter().position(|&id| id == PADDING) {
        return Err(Error::InvalidSession(format!(
            "session {row} contains padding id 0 at position {pos}"
        )));
    }
    Ok(())
}

fn validate_target(row: usize, target: ItemId) -> Result<()> {
    if target == PADDING {
        return Err(Error::InvalidSession(format!(
            "session {row} has target 0 (reserved for padding)"
        )));
    }
    Ok(())
}

/// Count of real (non-padding) positions in a padded row, checking that
/// the mask is a prefix of ones that agrees with the item ids.
fn real_len(row: usize, input: &[ItemId], mask: &[u8]) -> Result<usize> {
    let len = mask.iter().take_while(|&&m| m == 1).count();
    if len == 0 {
        return Err(Error::InvalidSession(format!("session {row} has no real item")));
    }
    if mask[len..].iter().any(|&m| m != 0) {
        return Err(Error::InvalidSession(format!(
            "session {row} has a real item after padding"
        )));
    }
    for (pos, (&id, &m)) in input.iter().zip(mask).enumerate() {
        if (m == 1) == (id == PADDING) {
            return Err(Error::InvalidSession(format!(
                "session {row}: item {id} at position {pos} disagrees with mask {m}"
            )));
        }
    }
    Ok(len)
}

/// A padded partition of sessions (train, validation or test).
#[derive(Debug, Clone)]
pub struct SessionDataset {
    inputs: Vec<Vec<ItemId>>,
    mask: Vec<Vec<u8>>,
    targets: Vec<ItemId>,
    len_max: usize,
}

impl SessionDataset {
    /// Validate and pad raw sessions.
    pub fn new(sessions: Vec<Vec<ItemId>>, targets: Vec<ItemId>) -> Result<Self> {
        check_dim("targets", sessions.len(), targets.len())?;
        if sessions.is_empty() {
            return Err(Error::EmptyBatch);
        }
        for (row, (session, &target)) in sessions.iter().zip(&targets).enumerate() {
            validate_session(row, session)?;
            validate_target(row, target)?;
        }
        let len_max = sessions.iter().map(Vec::len).max().unwrap_or(0);
        let (inputs, mask) = pad_sessions(&sessions, len_max);
        Ok(Self {
            inputs,
            mask,
            targets,
            len_max,
        })
    }

    pub fn from_raw(raw: RawSessions) -> Result<Self> {
        Self::new(raw.sessions, raw.targets)
    }

    /// Load a partition from a JSON file (see [`RawSessions`]).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let raw: RawSessions = serde_json::from_str(&text)?;
        Self::from_raw(raw)
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Padded sequence length shared by every session.
    pub fn len_max(&self) -> usize {
        self.len_max
    }

    pub fn inputs(&self) -> &[Vec<ItemId>] {
        &self.inputs
    }

    pub fn mask(&self) -> &[Vec<u8>] {
        &self.mask
    }

    pub fn targets(&self) -> &[ItemId] {
        &self.targets
    }

    /// Sessions without their padding.
    pub fn sessions(&self) -> impl Iterator<Item = &[ItemId]> + '_ {
        self.inputs.iter().zip(&self.mask).map(|(input, mask)| {
            let len = mask.iter().filter(|&&m| m == 1).count();
            &input[..len]
        })
    }

    /// Largest item id seen in inputs or targets.
    pub fn max_item_id(&self) -> ItemId {
        let max_input = self.inputs.iter().flatten().copied().max().unwrap_or(0);
        let max_target = self.targets.iter().copied().max().unwrap_or(0);
        max_input.max(max_target)
    }

    /// Embedding rows needed for this dataset: max item id + 1 (row 0 is padding).
    pub fn n_items(&self) -> usize {
        self.max_item_id() as usize + 1
    }

    /// Mini-batch index slices in dataset order; the last slice may be short.
    pub fn batch_slices(&self, batch_size: usize) -> Result<Vec<Vec<usize>>> {
        let order: Vec<usize> = (0..self.len()).collect();
        chunk_order(order, batch_size)
    }

    /// Mini-batch index slices over a random permutation of the dataset.
    pub fn shuffled_batch_slices<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Vec<Vec<usize>>> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        chunk_order(order, batch_size)
    }

    /// Gather the rows at `indices` into a batch.
    pub fn slice(&self, indices: &[usize]) -> Result<SessionBatch> {
        if indices.is_empty() {
            return Err(Error::EmptyBatch);
        }
        let mut inputs = Vec::with_capacity(indices.len());
        let mut mask = Vec::with_capacity(indices.len());
        let mut targets = Vec::with_capacity(indices.len());
        for &i in indices {
            if i >= self.len() {
                return Err(Error::DimensionMismatch {
                    what: "batch index",
                    expected: self.len(),
                    got: i,
                });
            }
            inputs.push(self.inputs[i].clone());
            mask.push(self.mask[i].clone());
            targets.push(self.targets[i]);
        }
        Ok(SessionBatch {
            inputs,
            mask,
            targets,
        })
    }

    /// Hold out `portion` of the sessions (after shuffling) as a validation set.
    ///
    /// Both halves are re-padded to their own maximum length.
    pub fn split_validation<R: Rng + ?Sized>(
        &self,
        portion: f64,
        rng: &mut R,
    ) -> Result<(Self, Self)> {
        if !(portion > 0.0 && portion < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "validation portion must be in (0, 1), got {portion}"
            )));
        }
        let n_train = (self.len() as f64 * (1.0 - portion)).round() as usize;
        let n_valid = self.len() - n_train.min(self.len());
        if n_train == 0 || n_valid == 0 {
            return Err(Error::InvalidConfig(format!(
                "validation portion {portion} of {} sessions leaves {n_train} for training and {n_valid} for validation",
                self.len()
            )));
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        let sessions: Vec<Vec<ItemId>> = self.sessions().map(<[ItemId]>::to_vec).collect();
        let pick = |idx: &[usize]| -> Result<Self> {
            Self::new(
                idx.iter().map(|&i| sessions[i].clone()).collect(),
                idx.iter().map(|&i| self.targets[i]).collect(),
            )
        };
        let (train, valid) = order.split_at(n_train);
        Ok((pick(train)?, pick(valid)?))
    }
}

fn chunk_order(order: Vec<usize>, batch_size: usize) -> Result<Vec<Vec<usize>>> {
    if batch_size == 0 {
        return Err(Error::InvalidConfig("batch_size must be positive".into()));
    }
    Ok(order.chunks(batch_size).map(<[usize]>::to_vec).collect())
}

/// Labels covering the most frequent `fraction` of all target occurrences.
///
/// Labels are ranked by frequency (ties keep first-appearance order); the
/// result is the prefix whose cumulative count stays below
/// `round(total * fraction)`.
pub fn top_labels(labels: impl IntoIterator<Item = ItemId>, fraction: f64) -> Vec<ItemId> {
    let mut counts: HashMap<ItemId, usize> = HashMap::new();
    let mut order = Vec::new();
    let mut total = 0usize;
    for label in labels {
        total += 1;
        let count = counts.entry(label).or_insert(0);
        if *count == 0 {
            order.push(label);
        }
        *count += 1;
    }
    // stable: equal counts keep first-appearance order
    order.sort_by(|a, b| counts[b].cmp(&counts[a]));

    let split_point = (total as f64 * fraction).round_ties_even() as usize;
    let mut cumulative = 0usize;
    let split_idx = order
        .iter()
        .take_while(|label| {
            cumulative += counts[*label];
            cumulative < split_point
        })
        .count();
    order.truncate(split_idx);
    order
}

/// Input augmentation applied to training batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Augmentation {
    /// Drop one occurrence of a random item from sessions longer than one.
    Deletion,
    /// Insert a random in-batch item into sessions shorter than the padded length.
    Insertion,
}

/// One mini-batch of padded sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBatch {
    pub(crate) inputs: Vec<Vec<ItemId>>,
    pub(crate) mask: Vec<Vec<u8>>,
    pub(crate) targets: Vec<ItemId>,
}

impl SessionBatch {
    /// Build a batch from already padded rows, validating their shape.
    pub fn new(inputs: Vec<Vec<ItemId>>, mask: Vec<Vec<u8>>, targets: Vec<ItemId>) -> Result<Self> {
        if inputs.is_empty() {
            return Err(Error::EmptyBatch);
        }
        check_dim("batch masks", inputs.len(), mask.len())?;
        check_dim("batch targets", inputs.len(), targets.len())?;
        let seq_len = inputs[0].len();
        for (row, (input, m)) in inputs.iter().zip(&mask).enumerate() {
            check_dim("session length", seq_len, input.len())?;
            check_dim("mask length", seq_len, m.len())?;
            real_len(row, input, m)?;
            validate_target(row, targets[row])?;
        }
        Ok(Self {
            inputs,
            mask,
            targets,
        })
    }

    /// Pad unpadded sessions to the longest one and build a batch.
    pub fn from_sessions(sessions: &[Vec<ItemId>], targets: Vec<ItemId>) -> Result<Self> {
        let len_max = sessions.iter().map(Vec::len).max().unwrap_or(0);
        for (row, session) in sessions.iter().enumerate() {
            validate_session(row, session)?;
        }
        let (inputs, mask) = pad_sessions(sessions, len_max);
        Self::new(inputs, mask, targets)
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Padded sequence length `L`.
    pub fn seq_len(&self) -> usize {
        self.inputs.first().map_or(0, Vec::len)
    }

    pub fn inputs(&self) -> &[Vec<ItemId>] {
        &self.inputs
    }

    pub fn mask(&self) -> &[Vec<u8>] {
        &self.mask
    }

    pub fn targets(&self) -> &[ItemId] {
        &self.targets
    }

    /// Number of real positions per session.
    pub fn lengths(&self) -> Vec<usize> {
        self.mask
            .iter()
            .map(|m| m.iter().filter(|&&v| v == 1).count())
            .collect()
    }

    /// For each label in `top_labels`, the rows whose target equals it.
    pub fn top_label_groups(&self, top_labels: &[ItemId]) -> Vec<Vec<usize>> {
        top_labels
            .iter()
            .map(|&label| {
                self.targets
                    .iter()
                    .enumerate()
                    .filter(|(_, &t)| t == label)
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect()
    }

    /// Append augmented copies of some sessions to the batch.
    ///
    /// Augmented sessions keep their source target and the batch's padded length.
    /// Only the input prefix is edited: the target is neither part of the
    /// insertion pool nor counted when deciding which sessions are long enough
    /// to shrink or short enough to grow, so it never leaks into the inputs.
    /// Insertion positions range over `0..len`, so an item never lands after
    /// the last real one.
    pub fn augment<R: Rng + ?Sized>(&self, kind: Augmentation, rng: &mut R) -> Result<Self> {
        let seq_len = self.seq_len();
        let lengths = self.lengths();
        let sessions: Vec<&[ItemId]> = self
            .inputs
            .iter()
            .zip(&lengths)
            .map(|(input, &len)| &input[..len])
            .collect();

        let candidates: Vec<usize> = match kind {
            Augmentation::Deletion => (0..sessions.len()).filter(|&i| lengths[i] > 1).collect(),
            Augmentation::Insertion => (0..sessions.len())
                .filter(|&i| lengths[i] < seq_len)
                .collect(),
        };
        let amount = (candidates.len() as f64 * AUGMENT_FRACTION) as usize;
        let chosen = index::sample(rng, candidates.len(), amount);

        let mut pool: Vec<ItemId> = sessions.iter().flat_map(|s| s.iter().copied()).collect();
        pool.sort_unstable();
        pool.dedup();

        let mut extra = Vec::with_capacity(amount);
        let mut extra_targets = Vec::with_capacity(amount);
        for pick in chosen.iter() {
            let row = candidates[pick];
            let mut session = sessions[row].to_vec();
            match kind {
                Augmentation::Deletion => {
                    let item = session[rng.gen_range(0..session.len())];
                    if let Some(pos) = session.iter().position(|&id| id == item) {
                        session.remove(pos);
                    }
                }
                Augmentation::Insertion => {
                    let at = rng.gen_range(0..session.len());
                    if let Some(&item) = pool.choose(rng) {
                        session.insert(at, item);
                    }
                }
            }
            extra.push(session);
            extra_targets.push(self.targets[row]);
        }

        let (extra_inputs, extra_mask) = pad_sessions(&extra, seq_len);
        let mut out = self.clone();
        out.inputs.extend(extra_inputs);
        out.mask.extend(extra_mask);
        out.targets.extend(extra_targets);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn toy() -> SessionDataset {
        SessionDataset::new(
            vec![vec![1, 2, 3], vec![4], vec![2, 2, 5, 6], vec![7, 8]],
            vec![4, 5, 7, 1],
        )
        .unwrap()
    }

    #[test]
    fn test_padding_and_masks() {
        let data = toy();
        assert_eq!(data.len_max(), 4);
        assert_eq!(data.inputs()[1], vec![4, 0, 0, 0]);
        assert_eq!(data.mask()[1], vec![1, 0, 0, 0]);
        assert_eq!(data.mask()[2], vec![1, 1, 1, 1]);
        assert_eq!(data.max_item_id(), 8);
    }

    #[test]
    fn test_rejects_bad_sessions() {
        assert!(matches!(
            SessionDataset::new(vec![vec![]], vec![1]),
            Err(Error::InvalidSession(_))
        ));
        assert!(matches!(
            SessionDataset::new(vec![vec![1, 0, 2]], vec![1]),
            Err(Error::InvalidSession(_))
        ));
        assert!(matches!(
            SessionDataset::new(vec![vec![1]], vec![0]),
            Err(Error::InvalidSession(_))
        ));
        assert!(matches!(
            SessionDataset::new(vec![vec![1]], vec![1, 2]),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_batch_rejects_padding_before_item() {
        let err = SessionBatch::new(vec![vec![1, 0, 2]], vec![vec![1, 0, 1]], vec![3]);
        assert!(matches!(err, Err(Error::InvalidSession(_))));
        let err = SessionBatch::new(vec![vec![1, 2], vec![1]], vec![vec![1, 1], vec![1]], vec![3, 3]);
        assert!(matches!(err, Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn test_batch_slices_cover_everything() {
        let data = toy();
        let slices = data.batch_slices(3).unwrap();
        assert_eq!(slices, vec![vec![0, 1, 2], vec![3]]);

        let mut rng = StdRng::seed_from_u64(7);
        let mut seen: Vec<usize> = data
            .shuffled_batch_slices(3, &mut rng)
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(data.batch_slices(0).is_err());
    }

    #[test]
    fn test_split_validation_sizes() {
        let data = toy();
        let mut rng = StdRng::seed_from_u64(1);
        let (train, valid) = data.split_validation(0.25, &mut rng).unwrap();
        assert_eq!(train.len(), 3);
        assert_eq!(valid.len(), 1);
    }

    #[test]
    fn test_split_validation_rejects_empty_side() {
        let data = toy();
        let mut rng = StdRng::seed_from_u64(1);
        for portion in [0.0, 1.0, -0.5, f64::NAN] {
            assert!(matches!(
                data.split_validation(portion, &mut rng),
                Err(Error::InvalidConfig(_))
            ));
        }
        // round(4 * 0.05) = 0 held out
        let err = data.split_validation(0.05, &mut rng).unwrap_err();
        match err {
            Error::InvalidConfig(msg) => {
                assert!(msg.contains("0.05"), "{msg}");
                assert!(msg.contains("4 sessions"), "{msg}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        // round(4 * 0.05) = 0 left for training
        assert!(matches!(
            data.split_validation(0.95, &mut rng),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_top_labels_cumulative_cut() {
        // counts: 1 -> 3, 2 -> 2, 3 -> 1; split point round(4.5) = 4
        let top = top_labels([1, 2, 1, 3, 2, 1], 0.75);
        assert_eq!(top, vec![1]);
        let top = top_labels([5, 5, 6, 6, 7, 8, 9, 10], 0.75);
        // split point 6, cumulative [2, 4, 5, 6, ..] -> first three
        assert_eq!(top, vec![5, 6, 7]);
    }

    #[test]
    fn test_top_label_groups() {
        let data = toy();
        let batch = data.slice(&[0, 1, 2, 3]).unwrap();
        let groups = batch.top_label_groups(&[7, 4, 9]);
        assert_eq!(groups, vec![vec![2], vec![0], vec![]]);
    }

    /// Real items of row `i`.
    fn row(batch: &SessionBatch, i: usize) -> Vec<ItemId> {
        batch.inputs()[i][..batch.lengths()[i]].to_vec()
    }

    /// Rows of `batch` that `augment` appended, each paired with its source
    /// row (toy targets are distinct, so the target identifies the source).
    fn appended(batch: &SessionBatch, out: &SessionBatch) -> Vec<(usize, Vec<ItemId>)> {
        (batch.len()..out.len())
            .map(|r| {
                let src = batch
                    .targets()
                    .iter()
                    .position(|&t| t == out.targets()[r])
                    .unwrap();
                (src, row(out, r))
            })
            .collect()
    }

    #[test]
    fn test_deletion_augmentation() {
        let data = toy();
        let batch = data.slice(&[0, 1, 2, 3]).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let out = batch.augment(Augmentation::Deletion, &mut rng).unwrap();
        // 3 eligible sessions, 80% -> 2 copies
        assert_eq!(out.len(), 6);
        assert_eq!(out.seq_len(), 4);
        assert_eq!(&out.inputs()[..4], batch.inputs());

        let copies = appended(&batch, &out);
        assert_ne!(copies[0].0, copies[1].0);
        for (src, copy) in copies {
            let source = row(&batch, src);
            // [4] is the only session too short to shrink
            assert_ne!(src, 1);
            assert_eq!(copy.len(), source.len() - 1);
            assert!((0..source.len()).any(|pos| {
                let mut s = source.clone();
                s.remove(pos);
                s == copy
            }));
        }
        SessionBatch::new(out.inputs.clone(), out.mask.clone(), out.targets.clone()).unwrap();
    }

    #[test]
    fn test_insertion_augmentation_keeps_len() {
        let data = toy();
        let batch = data.slice(&[0, 1, 2, 3]).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let out = batch.augment(Augmentation::Insertion, &mut rng).unwrap();
        assert_eq!(out.len(), 4 + 2);
        assert_eq!(out.seq_len(), 4);

        let pool = [1, 2, 3, 4, 5, 6, 7, 8];
        for (src, copy) in appended(&batch, &out) {
            let source = row(&batch, src);
            // [2, 2, 5, 6] already fills the padded length
            assert_ne!(src, 2);
            assert_eq!(copy.len(), source.len() + 1);
            assert!((0..copy.len()).any(|pos| {
                let mut c = copy.clone();
                let item = c.remove(pos);
                c == source && pool.contains(&item)
            }));
        }
    }

    #[test]
    fn test_augment_without_candidates_is_identity() {
        let batch = SessionBatch::from_sessions(&[vec![3], vec![5]], vec![1, 2]).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(batch.augment(Augmentation::Deletion, &mut rng).unwrap(), batch);
        assert_eq!(batch.augment(Augmentation::Insertion, &mut rng).unwrap(), batch);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, r#"{"sessions": [[3, 1], [2]], "targets": [2, 5]}"#).unwrap();

        let data = SessionDataset::from_json_file(&path).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.len_max(), 2);
        assert_eq!(data.n_items(), 6);
        assert_eq!(data.inputs()[1], vec![2, 0]);

        std::fs::write(&path, r#"{"sessions": [[3, 1]], "targets": []}"#).unwrap();
        assert!(SessionDataset::from_json_file(&path).is_err());
        assert!(matches!(
            SessionDataset::from_json_file(dir.path().join("missing.json")),
            Err(Error::Io(_))
        ));
    }
}
