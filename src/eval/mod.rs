//! Image-quality metrics and evaluation

mod evaluate;
mod metrics;

pub use evaluate::{
    display_grouped_metrics, display_metrics, evaluate_baseline, evaluate_model,
    normalise_sample, resize_image, summarise, EvaluationReport, MetricSummary,
};
pub use metrics::{auto_rois, cnr, compute_metrics, enl, mse, psnr, ssim, ImageMetrics, Roi};
