use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub const NUM_CLASSES: usize = 8;

/// The eight RAVDESS emotion classes.
///
/// Declaration order is the class order used by probability vectors,
/// confusion matrices and reports.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Emotion {
    Neutral,
    Calm,
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgust,
    Surprised,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EmotionError {
    #[error("unknown emotion id {0} (expected 1..=8)")]
    UnknownId(u8),

    #[error("file name does not follow the RAVDESS naming scheme: {0}")]
    UnrecognizedFileName(String),
}

impl Emotion {
    pub const ALL: [Emotion; NUM_CLASSES] = [
        Emotion::Neutral,
        Emotion::Calm,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Fearful,
        Emotion::Disgust,
        Emotion::Surprised,
    ];

    pub fn from_id(id: u8) -> Result<Self, EmotionError> {
        match id {
            1..=8 => Ok(Self::ALL[usize::from(id - 1)]),
            _ => Err(EmotionError::UnknownId(id)),
        }
    }

    /// RAVDESS id, 1..=8.
    pub fn id(self) -> u8 {
        self.index() as u8 + 1
    }

    /// Position in [`Emotion::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Emotion::Neutral => "Neutral",
            Emotion::Calm => "Calm",
            Emotion::Happy => "Happy",
            Emotion::Sad => "Sad",
            Emotion::Angry => "Angry",
            Emotion::Fearful => "Fearful",
            Emotion::Disgust => "Disgust",
            Emotion::Surprised => "Surprised",
        }
    }

    /// Parses the label encoded in a RAVDESS file name.
    ///
    /// `03-01-05-01-02-01-12.wav` is modality-channel-emotion-intensity-
    /// statement-repetition-actor; the third field is the emotion id.
    pub fn from_ravdess_filename(path: &Path) -> Result<Self, EmotionError> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let unrecognized = || EmotionError::UnrecognizedFileName(path.display().to_string());

        let fields: Vec<&str> = stem.split('-').collect();
        if fields.len() != 7 {
            return Err(unrecognized());
        }
        let id: u8 = fields[2].parse().map_err(|_| unrecognized())?;
        Self::from_id(id)
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_in_declaration_order() {
        for (i, emotion) in Emotion::ALL.iter().enumerate() {
            assert_eq!(emotion.index(), i);
            assert_eq!(Emotion::from_id(emotion.id()).unwrap(), *emotion);
        }
        assert_eq!(Emotion::Neutral.id(), 1);
        assert_eq!(Emotion::Surprised.id(), 8);
    }

    #[test]
    fn rejects_out_of_range_ids() {
        assert_eq!(Emotion::from_id(0), Err(EmotionError::UnknownId(0)));
        assert_eq!(Emotion::from_id(9), Err(EmotionError::UnknownId(9)));
    }

    #[test]
    fn parses_ravdess_file_names() {
        let e = Emotion::from_ravdess_filename(Path::new("Actor_12/03-01-05-01-02-01-12.wav"))
            .expect("valid name");
        assert_eq!(e, Emotion::Angry);

        let e = Emotion::from_ravdess_filename(Path::new("03-01-02-02-01-02-01.wav")).unwrap();
        assert_eq!(e, Emotion::Calm);
    }

    #[test]
    fn rejects_foreign_file_names() {
        assert!(Emotion::from_ravdess_filename(Path::new("recording.wav")).is_err());
        assert!(Emotion::from_ravdess_filename(Path::new("03-01-xx-01-02-01-12.wav")).is_err());
        assert!(Emotion::from_ravdess_filename(Path::new("03-01-09-01-02-01-12.wav")).is_err());
    }
}
