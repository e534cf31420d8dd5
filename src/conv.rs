//! Gated graph propagation over session graphs.
//!
//! [`GatedGraphConv`] is the gated graph neural network cell of SR-GNN
//! (Wu et al., 2019), itself a variant of GGNN (Li et al., 2016): messages
//! from predecessors and successors are aggregated separately, then blended
//! into the previous node state by a GRU update.
//!
//! ```text
//! a_in  = A_in  (h W_in  + b_in)  + b_iah
//! a_out = A_out (h W_out + b_out) + b_oah
//! x     = [a_in ; a_out]
//! r     = sigmoid(x W_ir + h W_hr)
//! z     = sigmoid(x W_iz + h W_hz)
//! n     = tanh(x W_in' + r * (h W_hn))
//! h'    = n + z * (h - n)
//! ```
//!
//! Each node is updated independently given its aggregated messages, so
//! padded nodes (all-zero adjacency rows and columns) never influence real ones.

use candle_core::{Tensor, D};
use candle_nn::ops::sigmoid;
use candle_nn::{Init, Linear, Module, VarBuilder};

use crate::error::{check_dim, Error, Result};

/// Uniform initialiser in `[-stdv, stdv]`.
pub(crate) fn uniform(stdv: f64) -> Init {
    Init::Uniform {
        lo: -stdv,
        up: stdv,
    }
}

/// Linear layer whose weight and bias are drawn from `uniform(stdv)`.
pub(crate) fn uniform_linear(
    in_features: usize,
    out_features: usize,
    bias: bool,
    stdv: f64,
    vb: VarBuilder,
) -> candle_core::Result<Linear> {
    let weight = vb.get_with_hints((out_features, in_features), "weight", uniform(stdv))?;
    let bias = if bias {
        Some(vb.get_with_hints(out_features, "bias", uniform(stdv))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

/// Gated graph propagation cell (SR-GNN).
pub struct GatedGraphConv {
    edge_in: Linear,
    edge_out: Linear,
    /// Input-to-gates projection, weight `(3H, 2H)`.
    input_gates: Linear,
    /// Hidden-to-gates projection, weight `(3H, H)`.
    hidden_gates: Linear,
    b_iah: Tensor,
    b_oah: Tensor,
    hidden: usize,
    steps: usize,
}

impl GatedGraphConv {
    /// Create a propagation cell.
    ///
    /// # Arguments
    /// - `hidden`: Node feature width `H`
    /// - `steps`: Number of propagation steps (commonly 1)
    /// - `vb`: Variable builder for parameter initialization
    pub fn new(hidden: usize, steps: usize, vb: VarBuilder) -> Result<Self> {
        if hidden == 0 {
            return Err(Error::InvalidConfig("hidden size must be positive".into()));
        }
        if steps == 0 {
            return Err(Error::InvalidConfig(
                "propagation needs at least one step".into(),
            ));
        }
        let stdv = 1.0 / (hidden as f64).sqrt();

        let edge_in = uniform_linear(hidden, hidden, true, stdv, vb.pp("linear_edge_in"))?;
        let edge_out = uniform_linear(hidden, hidden, true, stdv, vb.pp("linear_edge_out"))?;
        let w_ih = vb.get_with_hints((3 * hidden, 2 * hidden), "w_ih", uniform(stdv))?;
        let b_ih = vb.get_with_hints(3 * hidden, "b_ih", uniform(stdv))?;
        let w_hh = vb.get_with_hints((3 * hidden, hidden), "w_hh", uniform(stdv))?;
        let b_hh = vb.get_with_hints(3 * hidden, "b_hh", uniform(stdv))?;
        let b_iah = vb.get_with_hints(hidden, "b_iah", uniform(stdv))?;
        let b_oah = vb.get_with_hints(hidden, "b_oah", uniform(stdv))?;

        Ok(Self {
            edge_in,
            edge_out,
            input_gates: Linear::new(w_ih, Some(b_ih)),
            hidden_gates: Linear::new(w_hh, Some(b_hh)),
            b_iah,
            b_oah,
            hidden,
            steps,
        })
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `adjacency`: `(B, N, 2N)` concatenated incoming/outgoing adjacency
    /// - `hidden`: `(B, N, H)` node features
    ///
    /// # Returns
    /// - Updated node features `(B, N, H)`
    pub fn forward(&self, adjacency: &Tensor, hidden: &Tensor) -> Result<Tensor> {
        let (b, n, h) = hidden.dims3()?;
        check_dim("node feature width", self.hidden, h)?;
        let (ab, an, aw) = adjacency.dims3()?;
        check_dim("adjacency batch", b, ab)?;
        check_dim("adjacency rows", n, an)?;
        check_dim("adjacency width", 2 * n, aw)?;

        let a_in = adjacency.narrow(2, 0, n)?.contiguous()?;
        let a_out = adjacency.narrow(2, n, n)?.contiguous()?;

        let mut state = hidden.clone();
        for _ in 0..self.steps {
            state = self.cell(&a_in, &a_out, &state)?;
        }
        Ok(state)
    }

    fn cell(&self, a_in: &Tensor, a_out: &Tensor, hidden: &Tensor) -> candle_core::Result<Tensor> {
        let input_in = a_in
            .matmul(&self.edge_in.forward(hidden)?)?
            .broadcast_add(&self.b_iah)?;
        let input_out = a_out
            .matmul(&self.edge_out.forward(hidden)?)?
            .broadcast_add(&self.b_oah)?;
        let inputs = Tensor::cat(&[&input_in, &input_out], D::Minus1)?;

        let gi = self.input_gates.forward(&inputs)?.chunk(3, D::Minus1)?;
        let gh = self.hidden_gates.forward(hidden)?.chunk(3, D::Minus1)?;

        let reset_gate = sigmoid(&(&gi[0] + &gh[0])?)?;
        let input_gate = sigmoid(&(&gi[1] + &gh[1])?)?;
        let new_gate = (&gi[2] + (&reset_gate * &gh[2])?)?.tanh()?;

        let delta = (hidden - &new_gate)?;
        &new_gate + (&input_gate * &delta)?
    }
}
