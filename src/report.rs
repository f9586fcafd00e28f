use std::fs::{self, File};
use std::path::Path;

use plotters::{prelude::*, style::register_font};

use crate::error::ReportError;
use crate::training::EpochMetrics;

const PLOT_SIZE: (u32, u32) = (1200, 500);

/// Bundled so titles and tick labels render without a system font lookup.
const FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// Draws the loss and accuracy curves side by side and writes them to `path` as a PNG.
pub fn plot_metrics<P: AsRef<Path>>(
    losses: &[f64],
    accuracies: &[f64],
    path: P,
) -> Result<(), ReportError> {
    if losses.len() != accuracies.len() {
        return Err(ReportError::LengthMismatch {
            losses: losses.len(),
            accuracies: accuracies.len(),
        });
    }

    register_font("sans-serif", FontStyle::Normal, FONT)
        .map_err(|_| ReportError::Draw("bundled font could not be parsed".to_string()))?;

    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let root = BitMapBackend::new(path, PLOT_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(draw_error)?;
    let panels = root.split_evenly((1, 2));

    let (loss_min, loss_max) = value_range(losses);
    draw_curve(
        &panels[0],
        CurveStyle {
            title: "Training Loss Curve",
            y_desc: "Loss",
            legend: "Training Loss",
            color: BLUE,
        },
        losses,
        loss_min..loss_max,
    )?;
    draw_curve(
        &panels[1],
        CurveStyle {
            title: "Training Accuracy Curve",
            y_desc: "Accuracy (%)",
            legend: "Training Accuracy",
            color: GREEN,
        },
        accuracies,
        0.0..100.0,
    )?;

    root.present().map_err(draw_error)?;
    log::info!("Saved training curves to {}", path.display());

    Ok(())
}

/// Writes the epoch records as pretty-printed JSON.
pub fn save_metrics_json<P: AsRef<Path>>(
    metrics: &[EpochMetrics],
    path: P,
) -> Result<(), ReportError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, metrics)?;
    Ok(())
}

struct CurveStyle {
    title: &'static str,
    y_desc: &'static str,
    legend: &'static str,
    color: RGBColor,
}

fn draw_curve<DB: DrawingBackend>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    style: CurveStyle,
    values: &[f64],
    y_range: std::ops::Range<f64>,
) -> Result<(), ReportError> {
    let mut chart = ChartBuilder::on(area)
        .caption(style.title, ("sans-serif", 24))
        .margin(15)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0.5..values.len() as f64 + 0.5, y_range)
        .map_err(draw_error)?;

    chart
        .configure_mesh()
        .x_desc("Epoch")
        .y_desc(style.y_desc)
        .draw()
        .map_err(draw_error)?;

    // Epochs are 1-based; non-finite values are left out of the chart.
    let points = values
        .iter()
        .enumerate()
        .filter(|(_, value)| value.is_finite())
        .map(|(i, &value)| ((i + 1) as f64, value))
        .collect::<Vec<_>>();
    let color = style.color;

    chart
        .draw_series(LineSeries::new(points.clone(), color.stroke_width(2)))
        .map_err(draw_error)?
        .label(style.legend)
        .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    chart
        .draw_series(
            points
                .into_iter()
                .map(|point| Circle::new(point, 4, color.filled())),
        )
        .map_err(draw_error)?;

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(draw_error)?;

    Ok(())
}

/// Finite min/max of `values` with some headroom, never an empty range.
fn value_range(values: &[f64]) -> (f64, f64) {
    let finite = values.iter().copied().filter(|v| v.is_finite());
    let (min, max) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), v| {
        (min.min(v), max.max(v))
    });

    if min > max {
        return (0.0, 1.0);
    }

    let padding = ((max - min) * 0.1).max(0.05);
    ((min - padding).max(0.0), max + padding)
}

fn draw_error<E: std::error::Error + Send + Sync>(err: DrawingAreaErrorKind<E>) -> ReportError {
    ReportError::Draw(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_series_are_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let result = plot_metrics(&[1.0, 0.5], &[40.0], dir.path().join("curves.png"));

        assert!(matches!(
            result,
            Err(ReportError::LengthMismatch {
                losses: 2,
                accuracies: 1
            })
        ));
    }

    #[test]
    fn curves_are_written_as_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plots").join("curves.png");

        plot_metrics(&[2.2, 1.7, 1.4], &[18.0, 35.5, 47.0], &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"\x89PNG"));
        let image = image::load_from_memory(&bytes).unwrap();
        assert_eq!((image.width(), image.height()), PLOT_SIZE);
    }

    #[test]
    fn range_is_padded_and_never_empty() {
        assert_eq!(value_range(&[]), (0.0, 1.0));
        assert_eq!(value_range(&[f64::NAN]), (0.0, 1.0));

        let (min, max) = value_range(&[2.0, 1.0, f64::INFINITY]);
        assert!(min < 1.0 && max > 2.0);

        let (min, max) = value_range(&[0.7]);
        assert!(min < 0.7 && max > 0.7);
    }

    #[test]
    fn metrics_are_saved_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("metrics.json");
        let metrics = vec![EpochMetrics {
            epoch: 1,
            loss: 2.1,
            accuracy: 23.5,
            num_batches: 8,
            num_samples: 256,
            window_losses: vec![2.3, 1.9],
        }];

        save_metrics_json(&metrics, &path).unwrap();

        let loaded: Vec<EpochMetrics> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(loaded, metrics);
    }
}
