//! Plots training curves

use std::error::Error;

use plotters::{
    chart::ChartBuilder,
    prelude::{BitMapBackend, IntoDrawingArea, LineSeries},
    style::{BLUE, WHITE},
};

/// Plots `losses` against their step index and saves a PNG to `file_name`
pub fn plot_losses(losses: &[f32], file_name: &str, title: &str) -> Result<(), Box<dyn Error>> {
    if losses.is_empty() {
        return Err("no losses to plot".into());
    }
    let finite = losses.iter().copied().filter(|l| l.is_finite());
    let (lo, hi) = finite.fold((f32::MAX, f32::MIN), |(lo, hi), l| (lo.min(l), hi.max(l)));
    if lo > hi {
        return Err("every loss is NaN or infinite".into());
    }
    // a flat curve still needs a non-empty y range
    let (lo, hi) = if lo == hi { (lo - 1.0, lo + 1.0) } else { (lo, hi) };

    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root_area)
        .caption(title, ("sans-serif", 30))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(50)
        .build_cartesian_2d(0..losses.len(), lo..hi)?;

    chart.configure_mesh().x_desc("step").y_desc("loss").draw()?;

    chart.draw_series(LineSeries::new(
        losses
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .map(|(i, l)| (i, *l)),
        &BLUE,
    ))?;

    root_area.present()?;
    log::info!("Loss plot saved to '{}'.", file_name);
    Ok(())
}
