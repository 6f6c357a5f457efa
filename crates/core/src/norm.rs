//! Normalisation layers.
//!
//! The GShard builder uses a bias-less RMS norm (no mean subtraction, scale
//! initialised to 1, stored as `<scope>/w/scale`). Batch-major transformer
//! layers use a standard layer norm with scale and bias.

use candle_core::{Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Normalisation over the last axis.
pub enum NormLayer {
    /// `x * rsqrt(mean(x²) + eps) * scale`
    Rms { scale: Tensor, eps: f64 },
    /// `(x - mean) * rsqrt(var + eps) * scale + bias`
    Layer { scale: Tensor, bias: Tensor, eps: f64 },
}

impl NormLayer {
    /// Builder layer norm. `vb` should be scoped to the layer (e.g. `vb.pp("ln")`).
    pub fn rms(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let scale = vb.pp("w").get_with_hints(dim, "scale", Init::Const(1.0))?;
        Ok(Self::Rms { scale, eps })
    }

    pub fn layer(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let scale = vb.get_with_hints(dim, "scale", Init::Const(1.0))?;
        let bias = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
        Ok(Self::Layer { scale, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Rms { scale, eps } => {
                let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
                let inv = (variance + *eps)?.sqrt()?.recip()?;
                x.broadcast_mul(&inv)?.broadcast_mul(scale)
            }
            Self::Layer { scale, bias, eps } => {
                let mean = x.mean_keepdim(D::Minus1)?;
                let centered = x.broadcast_sub(&mean)?;
                let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
                let inv = (variance + *eps)?.sqrt()?.recip()?;
                centered
                    .broadcast_mul(&inv)?
                    .broadcast_mul(scale)?
                    .broadcast_add(bias)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn rms_norm_does_not_center() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ln = NormLayer::rms(2, 0.0, vb.pp("ln")).unwrap();
        let x = Tensor::new(&[[3f32, 4.]], &Device::Cpu).unwrap();
        let y = ln.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        // rms = sqrt((9 + 16) / 2)
        let rms = (12.5f32).sqrt();
        assert!((y[0][0] - 3.0 / rms).abs() < 1e-5);
        assert!((y[0][1] - 4.0 / rms).abs() < 1e-5);
        assert!(varmap.data().lock().unwrap().contains_key("ln.w.scale"));
    }

    #[test]
    fn layer_norm_centers_and_scales() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ln = NormLayer::layer(4, 1e-6, vb.pp("ln")).unwrap();
        let x = Tensor::new(&[[1f32, 2., 3., 4.]], &Device::Cpu).unwrap();
        let y = ln.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        let mean: f32 = y[0].iter().sum::<f32>() / 4.0;
        let var: f32 = y[0].iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }
}
