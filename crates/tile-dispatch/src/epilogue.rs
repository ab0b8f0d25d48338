//! Output epilogue: scale combination and the single narrowing step.
//!
//! The accumulator of every tile passes through exactly one [`Epilogue`]
//! before it is stored. The element operation multiplies by the activation and
//! weight scales (and the routing weight in stage 2) and the result is rounded
//! once into the output type. There are no partial-tile exceptions.

use crate::types::DataType;

/// Multiply the accumulator by two independent scale factors.
///
/// The two factors commute up to rounding; [`MultiplyMultiply::swapped`]
/// gives the same operation with the scale buffers exchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiplyMultiply {
    pub a_scale: f32,
    pub w_scale: f32,
}

impl MultiplyMultiply {
    pub const IDENTITY: Self = Self {
        a_scale: 1.0,
        w_scale: 1.0,
    };

    pub const fn new(a_scale: f32, w_scale: f32) -> Self {
        Self { a_scale, w_scale }
    }

    /// Same operation with the factors applied in the opposite order.
    pub const fn swapped(self) -> Self {
        Self {
            a_scale: self.w_scale,
            w_scale: self.a_scale,
        }
    }

    #[inline]
    pub fn apply(&self, acc: f32) -> f32 {
        acc * self.a_scale * self.w_scale
    }
}

impl Default for MultiplyMultiply {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Element operation plus the output type it narrows into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Epilogue {
    pub op: MultiplyMultiply,
    /// Per-row routing weight, applied after the scales.
    pub routing_weight: Option<f32>,
    pub output: DataType,
}

impl Epilogue {
    pub fn new(op: MultiplyMultiply, output: DataType) -> Self {
        Self {
            op,
            routing_weight: None,
            output,
        }
    }

    pub fn with_routing_weight(mut self, weight: f32) -> Self {
        self.routing_weight = Some(weight);
        self
    }

    /// Scaled value before narrowing.
    #[inline]
    pub fn scale(&self, acc: f32) -> f32 {
        let v = self.op.apply(acc);
        match self.routing_weight {
            Some(w) => v * w,
            None => v,
        }
    }

    /// Scale and narrow a whole tile into output bytes.
    pub fn store(&self, acc: &[f32]) -> Vec<u8> {
        let scaled: Vec<f32> = acc.iter().map(|&v| self.scale(v)).collect();
        self.output.from_f32(&scaled)
    }
}
