//! SVG chart of a noise schedule.
//!
//! Draws `beta` (scaled to its own maximum) and `alpha_bar` as two
//! polylines over the step index, in a fixed `viewBox` so charts of
//! different step counts line up.

use svg::Document;
use svg::node::Text;
use svg::node::element::path::Data;
use svg::node::element::{Description, Path, Rectangle, Title};

use kasumi_diffusion::Schedule;

/// Chart width in user units.
const WIDTH: f64 = 640.0;
/// Chart height in user units.
const HEIGHT: f64 = 320.0;
/// Blank border around the plot area.
const MARGIN: f64 = 16.0;
const PLOT_WIDTH: f64 = WIDTH - 2.0 * MARGIN;
const PLOT_HEIGHT: f64 = HEIGHT - 2.0 * MARGIN;

/// Stroke colour of the `beta` curve.
pub const BETA_COLOR: &str = "#d9480f";
/// Stroke colour of the `alpha_bar` curve.
pub const ALPHA_BAR_COLOR: &str = "#1971c2";

/// Optional `<title>` and `<desc>` for the chart.
///
/// Text values are XML-escaped by the `svg` crate.
#[derive(Debug, Clone, Default)]
pub struct SvgMetadata<'a> {
    /// Emitted as `<title>`.
    pub title: Option<&'a str>,
    /// Emitted as `<desc>`, typically the schedule parameters.
    pub description: Option<&'a str>,
}

/// Render `schedule` as a standalone SVG document.
#[must_use]
pub fn schedule_svg(schedule: &Schedule, metadata: &SvgMetadata<'_>) -> String {
    let mut doc = Document::new()
        .set("width", WIDTH)
        .set("height", HEIGHT)
        .set("viewBox", (0, 0, WIDTH, HEIGHT));

    if let Some(title) = metadata.title {
        doc = doc.add(Title::new(title));
    }
    if let Some(description) = metadata.description {
        doc = doc.add(Description::new().add(Text::new(description)));
    }

    let frame = Rectangle::new()
        .set("x", MARGIN)
        .set("y", MARGIN)
        .set("width", PLOT_WIDTH)
        .set("height", PLOT_HEIGHT)
        .set("fill", "none")
        .set("stroke", "#adb5bd")
        .set("stroke-width", 1);
    doc = doc.add(frame);

    let beta_max = schedule.beta().iter().copied().fold(0.0_f64, f64::max);
    let beta_scale = if beta_max > 0.0 { beta_max } else { 1.0 };
    let scaled_beta = schedule.beta().iter().map(|b| b / beta_scale);

    doc = doc
        .add(curve("beta", scaled_beta, schedule.steps(), BETA_COLOR))
        .add(curve(
            "alpha-bar",
            schedule.alpha_bar().iter().copied(),
            schedule.steps(),
            ALPHA_BAR_COLOR,
        ));

    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{doc}\n")
}

/// One polyline of values in [0, 1], plotted bottom-up.
#[allow(clippy::cast_precision_loss)]
fn curve(id: &str, values: impl Iterator<Item = f64>, steps: usize, color: &str) -> Path {
    let last = steps.saturating_sub(1).max(1) as f64;
    let point = |i: usize, v: f64| {
        (
            (i as f64 / last).mul_add(PLOT_WIDTH, MARGIN),
            (1.0 - v.clamp(0.0, 1.0)).mul_add(PLOT_HEIGHT, MARGIN),
        )
    };

    let mut data = Data::new();
    let mut last_y = None;
    for (i, v) in values.enumerate() {
        data = if i == 0 {
            data.move_to(point(i, v))
        } else {
            data.line_to(point(i, v))
        };
        last_y = Some(v);
    }
    // A single step still gets a visible horizontal segment.
    if steps == 1
        && let Some(v) = last_y
    {
        data = data.line_to(point(1, v));
    }

    Path::new()
        .set("id", id)
        .set("d", data)
        .set("fill", "none")
        .set("stroke", color)
        .set("stroke-width", 2)
}
