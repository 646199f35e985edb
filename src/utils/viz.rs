//! Loss curves with plotters

use std::fmt::Debug;
use std::path::Path;

use plotters::prelude::*;

use super::ensure_parent_dir;
use crate::core::TrainingHistory;
use crate::{Result, SsmError};

fn viz_err<E: Debug>(err: E) -> SsmError {
    SsmError::Visualization(format!("{:?}", err))
}

/// Plot train and validation loss per epoch to a PNG
pub fn plot_history(history: &TrainingHistory, path: &Path) -> Result<()> {
    let epochs = history.loss.len().max(history.val_loss.len());
    if epochs == 0 {
        return Err(SsmError::Visualization("history is empty".to_string()));
    }
    let y_max = history
        .loss
        .iter()
        .chain(&history.val_loss)
        .copied()
        .filter(|v| v.is_finite())
        .fold(0.0f32, f32::max)
        .max(f32::EPSILON)
        * 1.1;

    ensure_parent_dir(path)?;
    let root = BitMapBackend::new(path, (800, 480)).into_drawing_area();
    root.fill(&WHITE).map_err(viz_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Speckle separation loss", ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(35)
        .y_label_area_size(60)
        .build_cartesian_2d(1usize..epochs.max(2), 0f32..y_max)
        .map_err(viz_err)?;
    chart
        .configure_mesh()
        .x_desc("epoch")
        .y_desc("loss")
        .draw()
        .map_err(viz_err)?;

    chart
        .draw_series(LineSeries::new(
            history.loss.iter().enumerate().map(|(i, &v)| (i + 1, v)),
            &BLUE,
        ))
        .map_err(viz_err)?
        .label("train")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));
    chart
        .draw_series(LineSeries::new(
            history.val_loss.iter().enumerate().map(|(i, &v)| (i + 1, v)),
            &RED,
        ))
        .map_err(viz_err)?
        .label("validation")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(viz_err)?;
    root.present().map_err(viz_err)?;
    Ok(())
}
