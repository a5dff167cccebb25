//! Metrics, confusion matrices and the report files written after training.

use crate::emotion::{Emotion, NUM_CLASSES};
use crate::model::{Classifier, ModelError};
use image::{ImageFormat, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const LOG_TARGET: &str = "evaluation";

const CELL_PX: u32 = 48;
const KEY_PX: u32 = 16;
/// Margin holding the class names, wide enough for nine 8px glyphs.
const LABEL_PX: u32 = 80;
const LABEL_PAD: u32 = 4;
const GLYPH_PX: u32 = 8;
const GRID_ORIGIN: u32 = LABEL_PX + KEY_PX;
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const TEXT_COLOUR: Rgb<u8> = Rgb([33, 33, 33]);

/// One key colour per class, in [`Emotion::ALL`] order.
const CLASS_COLOURS: [[u8; 3]; NUM_CLASSES] = [
    [158, 158, 158],
    [102, 187, 106],
    [255, 202, 40],
    [66, 165, 245],
    [239, 83, 80],
    [171, 71, 188],
    [141, 110, 99],
    [255, 112, 67],
];

#[derive(thiserror::Error, Debug)]
pub enum EvaluationError {
    #[error("{truth} true labels but {predicted} predictions")]
    LengthMismatch { truth: usize, predicted: usize },

    #[error("nothing to evaluate")]
    Empty,

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to render {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Rows are true classes, columns predicted classes.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfusionMatrix {
    counts: [[u32; NUM_CLASSES]; NUM_CLASSES],
}

impl ConfusionMatrix {
    pub fn from_predictions(truth: &[Emotion], predicted: &[Emotion]) -> Result<Self, EvaluationError> {
        if truth.len() != predicted.len() {
            return Err(EvaluationError::LengthMismatch {
                truth: truth.len(),
                predicted: predicted.len(),
            });
        }
        let mut counts = [[0u32; NUM_CLASSES]; NUM_CLASSES];
        for (t, p) in truth.iter().zip(predicted) {
            counts[t.index()][p.index()] += 1;
        }
        Ok(Self { counts })
    }

    pub fn counts(&self) -> &[[u32; NUM_CLASSES]; NUM_CLASSES] {
        &self.counts
    }

    pub fn get(&self, truth: Emotion, predicted: Emotion) -> u32 {
        self.counts[truth.index()][predicted.index()]
    }

    pub fn support(&self, class: Emotion) -> u32 {
        self.counts[class.index()].iter().sum()
    }

    pub fn predicted_count(&self, class: Emotion) -> u32 {
        self.counts.iter().map(|row| row[class.index()]).sum()
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> u32 {
        (0..NUM_CLASSES).map(|i| self.counts[i][i]).sum()
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), EvaluationError> {
        let csv_err = |source| EvaluationError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
        let mut header = vec!["true\\predicted"];
        header.extend(Emotion::ALL.iter().map(|e| e.name()));
        writer.write_record(&header).map_err(csv_err)?;
        for emotion in Emotion::ALL {
            let mut record = vec![emotion.name().to_owned()];
            record.extend(self.counts[emotion.index()].iter().map(u32::to_string));
            writer.write_record(&record).map_err(csv_err)?;
        }
        writer.flush().map_err(|e| csv_err(csv::Error::from(e)))?;
        Ok(())
    }

    /// Heatmap PNG. Class names run down the left (true class) and across
    /// the top (predicted class, written vertically), each followed by a
    /// strip of its key colour. Each cell is shaded by its share of the
    /// true-class row.
    pub fn render(&self) -> RgbImage {
        let side = GRID_ORIGIN + CELL_PX * NUM_CLASSES as u32;
        let mut img = RgbImage::from_pixel(side, side, WHITE);

        for (i, (emotion, colour)) in Emotion::ALL.iter().zip(CLASS_COLOURS).enumerate() {
            let offset = GRID_ORIGIN + CELL_PX * i as u32;
            fill(&mut img, offset, LABEL_PX, CELL_PX, KEY_PX, Rgb(colour));
            fill(&mut img, LABEL_PX, offset, KEY_PX, CELL_PX, Rgb(colour));

            let (along, across) = label_origin(emotion.name(), i);
            draw_text(&mut img, along, across, emotion.name(), false);
            draw_text(&mut img, across, along, emotion.name(), true);
        }

        for (row, counts) in self.counts.iter().enumerate() {
            let total: u32 = counts.iter().sum();
            for (col, &count) in counts.iter().enumerate() {
                let share = if total == 0 {
                    0.0
                } else {
                    count as f64 / total as f64
                };
                let shade = |full: f64| (255.0 - share * (255.0 - full)).round() as u8;
                fill(
                    &mut img,
                    GRID_ORIGIN + CELL_PX * col as u32,
                    GRID_ORIGIN + CELL_PX * row as u32,
                    CELL_PX - 1,
                    CELL_PX - 1,
                    Rgb([shade(8.0), shade(48.0), shade(107.0)]),
                );
            }
        }
        img
    }

    pub fn write_png(&self, path: &Path) -> Result<(), EvaluationError> {
        self.render()
            .save_with_format(path, ImageFormat::Png)
            .map_err(|source| EvaluationError::Image {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Where the label of class `index` starts: the offset along its margin
/// (right-aligned against the key strip) and the offset across it
/// (centred on the class's row or column).
fn label_origin(text: &str, index: usize) -> (u32, u32) {
    let length = GLYPH_PX * text.chars().count() as u32;
    let along = LABEL_PX.saturating_sub(LABEL_PAD + length);
    let across = GRID_ORIGIN + CELL_PX * index as u32 + (CELL_PX - GLYPH_PX) / 2;
    (along, across)
}

fn glyph(ch: char) -> [u8; 8] {
    font8x8::legacy::BASIC_LEGACY
        .get(ch as usize)
        .copied()
        .unwrap_or([0; 8])
}

/// Draws `text` left to right from `(x0, y0)`, or top to bottom with each
/// glyph turned a quarter clockwise when `vertical`.
fn draw_text(img: &mut RgbImage, x0: u32, y0: u32, text: &str, vertical: bool) {
    for (i, ch) in text.chars().enumerate() {
        let offset = GLYPH_PX * i as u32;
        for (gy, bits) in (0u32..).zip(glyph(ch)) {
            for gx in (0..GLYPH_PX).filter(|gx| bits & (1 << gx) != 0) {
                let (x, y) = if vertical {
                    (x0 + GLYPH_PX - 1 - gy, y0 + offset + gx)
                } else {
                    (x0 + offset + gx, y0 + gy)
                };
                if x < img.width() && y < img.height() {
                    img.put_pixel(x, y, TEXT_COLOUR);
                }
            }
        }
    }
}

fn fill(img: &mut RgbImage, x0: u32, y0: u32, w: u32, h: u32, colour: Rgb<u8>) {
    for y in y0..(y0 + h).min(img.height()) {
        for x in x0..(x0 + w).min(img.width()) {
            img.put_pixel(x, y, colour);
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClassMetrics {
    pub emotion: Emotion,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: u32,
}

fn ratio(num: u32, den: u32) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Scores for one model on one partition.
///
/// Macro averages weigh all eight classes equally, including classes that
/// are absent from the partition; an undefined ratio counts as 0.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EvaluationReport {
    pub accuracy: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub weighted_precision: f64,
    pub weighted_recall: f64,
    pub weighted_f1: f64,
    pub per_class: Vec<ClassMetrics>,
    pub confusion: ConfusionMatrix,
}

impl EvaluationReport {
    pub fn from_predictions(truth: &[Emotion], predicted: &[Emotion]) -> Result<Self, EvaluationError> {
        let confusion = ConfusionMatrix::from_predictions(truth, predicted)?;
        if confusion.total() == 0 {
            return Err(EvaluationError::Empty);
        }
        Ok(Self::from_confusion(confusion))
    }

    pub fn from_confusion(confusion: ConfusionMatrix) -> Self {
        let per_class: Vec<ClassMetrics> = Emotion::ALL
            .iter()
            .map(|&emotion| {
                let tp = confusion.get(emotion, emotion);
                let support = confusion.support(emotion);
                let precision = ratio(tp, confusion.predicted_count(emotion));
                let recall = ratio(tp, support);
                let f1 = if precision + recall == 0.0 {
                    0.0
                } else {
                    2.0 * precision * recall / (precision + recall)
                };
                ClassMetrics {
                    emotion,
                    precision,
                    recall,
                    f1,
                    support,
                }
            })
            .collect();

        let total = confusion.total();
        let macro_avg = |f: fn(&ClassMetrics) -> f64| per_class.iter().map(f).sum::<f64>() / NUM_CLASSES as f64;
        let weighted_avg = |f: fn(&ClassMetrics) -> f64| {
            if total == 0 {
                0.0
            } else {
                per_class.iter().map(|m| f(m) * m.support as f64).sum::<f64>() / total as f64
            }
        };

        Self {
            accuracy: ratio(confusion.correct(), total),
            macro_precision: macro_avg(|m| m.precision),
            macro_recall: macro_avg(|m| m.recall),
            macro_f1: macro_avg(|m| m.f1),
            weighted_precision: weighted_avg(|m| m.precision),
            weighted_recall: weighted_avg(|m| m.recall),
            weighted_f1: weighted_avg(|m| m.f1),
            per_class,
            confusion,
        }
    }

    /// Plain-text table with one row per class and the summary rows.
    pub fn classification_report(&self) -> String {
        let mut out = String::new();
        let total = self.confusion.total();
        let _ = writeln!(out, "{:>12} {:>9} {:>9} {:>9} {:>9}", "", "precision", "recall", "f1-score", "support");
        let _ = writeln!(out);
        for m in &self.per_class {
            let _ = writeln!(
                out,
                "{:>12} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                m.emotion.name(),
                m.precision,
                m.recall,
                m.f1,
                m.support
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "{:>12} {:>9} {:>9} {:>9.2} {:>9}", "accuracy", "", "", self.accuracy, total);
        let _ = writeln!(
            out,
            "{:>12} {:>9.2} {:>9.2} {:>9.2} {:>9}",
            "macro avg", self.macro_precision, self.macro_recall, self.macro_f1, total
        );
        let _ = writeln!(
            out,
            "{:>12} {:>9.2} {:>9.2} {:>9.2} {:>9}",
            "weighted avg", self.weighted_precision, self.weighted_recall, self.weighted_f1, total
        );
        out
    }

    pub fn write_classification_report(&self, path: &Path) -> Result<(), EvaluationError> {
        std::fs::write(path, self.classification_report()).map_err(|source| EvaluationError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Predicts `x` with `model` and scores against `y`.
pub fn evaluate<C: Classifier + ?Sized>(
    model: &C,
    x: &[Vec<f64>],
    y: &[Emotion],
) -> Result<EvaluationReport, EvaluationError> {
    let predicted = model.predict(x)?;
    let report = EvaluationReport::from_predictions(y, &predicted)?;
    tracing::debug!(
        target: LOG_TARGET,
        samples = y.len(),
        accuracy = report.accuracy,
        macro_f1 = report.macro_f1,
        "evaluated"
    );
    Ok(report)
}

/// `model,partition,accuracy,precision,recall,f1` with macro-averaged
/// scores, one line per `(model, partition, report)`.
pub fn write_comparison_csv(
    path: &Path,
    rows: &[(String, &str, &EvaluationReport)],
) -> Result<(), EvaluationError> {
    let csv_err = |source| EvaluationError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    writer
        .write_record(["model", "partition", "accuracy", "precision", "recall", "f1"])
        .map_err(csv_err)?;
    for (name, partition, report) in rows {
        writer
            .write_record([
                name.clone(),
                (*partition).to_owned(),
                format!("{:.4}", report.accuracy),
                format!("{:.4}", report.macro_precision),
                format!("{:.4}", report.macro_recall),
                format!("{:.4}", report.macro_f1),
            ])
            .map_err(csv_err)?;
    }
    writer.flush().map_err(|e| csv_err(csv::Error::from(e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use Emotion::*;

    #[test]
    fn perfect_predictions() {
        let truth = [Neutral, Calm, Happy, Sad, Angry, Fearful, Disgust, Surprised];
        let report = EvaluationReport::from_predictions(&truth, &truth).unwrap();
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.macro_f1, 1.0);
        assert_eq!(report.confusion.correct(), 8);
    }

    #[test]
    fn absent_classes_count_as_zero_in_macro_average() {
        let truth = [Happy, Happy, Sad, Sad];
        let predicted = [Happy, Sad, Sad, Sad];
        let report = EvaluationReport::from_predictions(&truth, &predicted).unwrap();

        assert_eq!(report.accuracy, 0.75);
        let happy = &report.per_class[Happy.index()];
        assert_eq!(happy.precision, 1.0);
        assert_eq!(happy.recall, 0.5);
        let sad = &report.per_class[Sad.index()];
        assert!((sad.precision - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(sad.recall, 1.0);
        let angry = &report.per_class[Angry.index()];
        assert_eq!((angry.precision, angry.recall, angry.f1, angry.support), (0.0, 0.0, 0.0, 0));

        let expected_macro_f1 = (happy.f1 + sad.f1) / 8.0;
        assert!((report.macro_f1 - expected_macro_f1).abs() < 1e-12);
        assert!(report.weighted_f1 > report.macro_f1);
    }

    #[test]
    fn confusion_rows_are_truth() {
        let truth = [Calm, Calm, Fearful];
        let predicted = [Fearful, Calm, Fearful];
        let cm = ConfusionMatrix::from_predictions(&truth, &predicted).unwrap();
        assert_eq!(cm.get(Calm, Fearful), 1);
        assert_eq!(cm.get(Fearful, Calm), 0);
        assert_eq!(cm.support(Calm), 2);
        assert_eq!(cm.predicted_count(Fearful), 2);
    }

    #[test]
    fn rejects_mismatched_and_empty_input() {
        assert!(matches!(
            EvaluationReport::from_predictions(&[Calm], &[]),
            Err(EvaluationError::LengthMismatch { truth: 1, predicted: 0 })
        ));
        assert!(matches!(
            EvaluationReport::from_predictions(&[], &[]),
            Err(EvaluationError::Empty)
        ));
    }

    #[test]
    fn report_text_lists_every_class_and_summary() {
        let report = EvaluationReport::from_predictions(&[Happy, Sad], &[Happy, Happy]).unwrap();
        let text = report.classification_report();
        for e in Emotion::ALL {
            assert!(text.contains(e.name()), "{}", e.name());
        }
        assert!(text.contains("accuracy"));
        assert!(text.contains("macro avg"));
        assert!(text.contains("weighted avg"));
    }

    #[test]
    fn writes_csv_and_png_files() {
        let dir = tempfile::tempdir().unwrap();
        let report = EvaluationReport::from_predictions(&[Happy, Sad, Sad], &[Happy, Sad, Happy]).unwrap();

        let cm_path = dir.path().join("confusion.csv");
        report.confusion.write_csv(&cm_path).unwrap();
        let text = std::fs::read_to_string(&cm_path).unwrap();
        assert_eq!(text.lines().count(), 1 + NUM_CLASSES);

        let cmp_path = dir.path().join("model_comparison.csv");
        write_comparison_csv(&cmp_path, &[("svm_tuned".to_owned(), "validation", &report)]).unwrap();
        let text = std::fs::read_to_string(&cmp_path).unwrap();
        assert!(text.starts_with("model,partition,accuracy,precision,recall,f1\n"));
        assert!(text.contains("svm_tuned,validation,0.6667"));

        let png_path = dir.path().join("confusion.png");
        report.confusion.write_png(&png_path).unwrap();
        let bytes = std::fs::read(&png_path).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[test]
    fn heatmap_shades_by_row_share() {
        let cm = ConfusionMatrix::from_predictions(&[Neutral, Neutral], &[Neutral, Neutral]).unwrap();
        let img = cm.render();
        let centre = GRID_ORIGIN + CELL_PX / 2;
        assert_eq!(*img.get_pixel(centre, centre), Rgb([8, 48, 107]));
        assert_eq!(*img.get_pixel(centre + CELL_PX, centre), WHITE);
        assert_eq!(*img.get_pixel(centre, LABEL_PX + 2), Rgb(CLASS_COLOURS[0]));
        assert_eq!(*img.get_pixel(LABEL_PX + 2, centre), Rgb(CLASS_COLOURS[0]));
    }

    #[test]
    fn heatmap_names_every_class_on_both_axes() {
        let img = ConfusionMatrix::default().render();
        let side = GRID_ORIGIN + CELL_PX * NUM_CLASSES as u32;
        assert_eq!(img.dimensions(), (side, side));

        for (i, emotion) in Emotion::ALL.iter().enumerate() {
            let name = emotion.name();
            let (along, across) = label_origin(name, i);
            assert!(along + GLYPH_PX * name.len() as u32 <= LABEL_PX, "{name} overflows");

            for (k, ch) in name.chars().enumerate() {
                let offset = GLYPH_PX * k as u32;
                let rows = glyph(ch);
                assert!(rows.iter().any(|&b| b != 0), "{ch} has no glyph");
                for gy in 0..GLYPH_PX {
                    for gx in 0..GLYPH_PX {
                        let inked = rows[gy as usize] & (1 << gx) != 0;
                        let expected = if inked { TEXT_COLOUR } else { WHITE };
                        // True-class label, read left to right.
                        assert_eq!(*img.get_pixel(along + offset + gx, across + gy), expected);
                        // Predicted-class label, read top to bottom.
                        assert_eq!(
                            *img.get_pixel(across + GLYPH_PX - 1 - gy, along + offset + gx),
                            expected
                        );
                    }
                }
            }
        }
    }
}
