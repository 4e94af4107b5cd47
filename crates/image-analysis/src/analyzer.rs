use crate::error::Result;
use crate::model::Stage;
use crate::pixels::DecodedImage;
use compute_dispatch::ComputeDispatcher;

/// A metric stage that reads decoded pixels.
///
/// Analyzers are independent of each other and may run concurrently on the same image.
/// Kernel work goes through the dispatcher so it can be offloaded.
pub trait PixelAnalyzer: Send + Sync {
    type Output: Send;

    fn stage(&self) -> Stage;

    fn analyze(&self, image: &DecodedImage, dispatcher: &ComputeDispatcher) -> Result<Self::Output>;
}
