pub mod attention;
pub mod gating;
pub mod init;
pub mod moe;
pub mod positional;
pub mod ste;

pub use attention::DynAttentionLayer;
pub use gating::{ExpertKind, GateCache, GatingNetwork};
pub use moe::DynMoeLayer;
pub use ste::straight_through_step;

use candle_core::{Device, Module, Result, Tensor, Var};
use candle_nn::{Embedding, LayerNorm, Linear};
use std::collections::HashMap;

use crate::config::{GatingKnobs, ModelKnobs};
use crate::model::init::{fan_in_bias, kaiming_uniform};

const LAYER_NORM_EPS: f64 = 1e-5;

/// LayerNorm whose weight/bias stay addressable as `Var`s for the optimizer
/// and checkpointing. The wrapped module shares the variables' storage.
struct NormLayer {
    weight: Var,
    bias: Var,
    inner: LayerNorm,
}

impl NormLayer {
    fn new(size: usize, device: &Device) -> Result<Self> {
        let weight = Var::from_tensor(&Tensor::ones(size, candle_core::DType::F32, device)?)?;
        let bias = Var::from_tensor(&Tensor::zeros(size, candle_core::DType::F32, device)?)?;
        let inner = LayerNorm::new(
            weight.as_tensor().clone(),
            bias.as_tensor().clone(),
            LAYER_NORM_EPS,
        );
        Ok(Self {
            weight,
            bias,
            inner,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.inner.forward(x)
    }

    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((format!("{prefix}.weight"), self.weight.clone()));
        out.push((format!("{prefix}.bias"), self.bias.clone()));
    }
}

/// Pre-norm residual block: gated attention, optional gated cross-attention
/// (decoder only), gated feed-forward experts.
pub struct DynOnnBlock {
    ln1: NormLayer,
    attn: DynAttentionLayer,
    cross: Option<(NormLayer, DynAttentionLayer)>,
    ln2: NormLayer,
    moe: DynMoeLayer,
}

impl DynOnnBlock {
    pub fn new(
        model: &ModelKnobs,
        gating: &GatingKnobs,
        is_decoder: bool,
        device: &Device,
    ) -> Result<Self> {
        let ln1 = NormLayer::new(model.hidden_size, device)?;
        let attn =
            DynAttentionLayer::new(model.hidden_size, model.head_dim, gating.attention, device)?;
        let cross = if is_decoder {
            let ln = NormLayer::new(model.hidden_size, device)?;
            let layer = DynAttentionLayer::new(
                model.hidden_size,
                model.head_dim,
                gating.attention,
                device,
            )?;
            Some((ln, layer))
        } else {
            None
        };
        let ln2 = NormLayer::new(model.hidden_size, device)?;
        let moe = DynMoeLayer::new(
            model.hidden_size,
            model.intermediate_size,
            gating.moe,
            device,
        )?;
        Ok(Self {
            ln1,
            attn,
            cross,
            ln2,
            moe,
        })
    }

    pub fn forward(
        &self,
        hidden: &Tensor,
        encoder_hidden: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Vec<GateCache>)> {
        let mut caches = Vec::new();

        let (attn_out, attn_caches) = self.attn.forward(&self.ln1.forward(hidden)?, None, train)?;
        let mut hidden = (hidden + attn_out)?;
        caches.extend(attn_caches);

        if let (Some((ln_cross, cross_attn)), Some(encoder_hidden)) =
            (self.cross.as_ref(), encoder_hidden)
        {
            let (cross_out, cross_caches) =
                cross_attn.forward(&ln_cross.forward(&hidden)?, Some(encoder_hidden), train)?;
            hidden = (hidden + cross_out)?;
            caches.extend(cross_caches);
        }

        let (moe_out, moe_cache) = self.moe.forward(&self.ln2.forward(&hidden)?, train)?;
        let hidden = (hidden + moe_out)?;
        caches.push(moe_cache);

        Ok((hidden, caches))
    }

    fn expert_layers(&self) -> Vec<(&'static str, ExpertLayerRef<'_>)> {
        let mut layers = vec![("attn", ExpertLayerRef::Attention(&self.attn))];
        if let Some((_, cross)) = self.cross.as_ref() {
            layers.push(("cross_attention", ExpertLayerRef::Attention(cross)));
        }
        layers.push(("moe", ExpertLayerRef::FeedForward(&self.moe)));
        layers
    }

    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        self.ln1.collect_vars(&format!("{prefix}.ln1"), out);
        self.attn.collect_vars(&format!("{prefix}.attn"), out);
        if let Some((ln_cross, cross)) = self.cross.as_ref() {
            ln_cross.collect_vars(&format!("{prefix}.ln_cross"), out);
            cross.collect_vars(&format!("{prefix}.cross_attention"), out);
        }
        self.ln2.collect_vars(&format!("{prefix}.ln2"), out);
        self.moe.collect_vars(&format!("{prefix}.moe"), out);
    }
}

/// Borrowed view over either expert-layer variant, used for the regeneration
/// sweep without runtime type inspection.
enum ExpertLayerRef<'a> {
    Attention(&'a DynAttentionLayer),
    FeedForward(&'a DynMoeLayer),
}

impl ExpertLayerRef<'_> {
    fn regenerate_dead_experts(&self) -> Result<usize> {
        match self {
            ExpertLayerRef::Attention(layer) => layer.regenerate_dead_experts(),
            ExpertLayerRef::FeedForward(layer) => layer.regenerate_dead_experts(),
        }
    }
}

pub struct Encoder {
    tok_embed_weight: Var,
    tok_embed: Embedding,
    object_finder: Option<(NormLayer, DynAttentionLayer)>,
    layers: Vec<DynOnnBlock>,
    final_ln: NormLayer,
    hidden_size: usize,
}

impl Encoder {
    pub fn new(
        model: &ModelKnobs,
        gating: &GatingKnobs,
        vocab_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let tok_embed_weight = Var::from_tensor(&Tensor::randn(
            0f32,
            1f32,
            (vocab_size, model.hidden_size),
            device,
        )?)?;
        let tok_embed = Embedding::new(tok_embed_weight.as_tensor().clone(), model.hidden_size);

        let object_finder = if model.use_object_finder {
            let ln = NormLayer::new(model.hidden_size, device)?;
            let layer = DynAttentionLayer::new(
                model.hidden_size,
                model.head_dim,
                gating.attention,
                device,
            )?;
            Some((ln, layer))
        } else {
            None
        };

        let layers = (0..model.num_hidden_layers)
            .map(|_| DynOnnBlock::new(model, gating, false, device))
            .collect::<Result<Vec<_>>>()?;
        let final_ln = NormLayer::new(model.hidden_size, device)?;

        Ok(Self {
            tok_embed_weight,
            tok_embed,
            object_finder,
            layers,
            final_ln,
            hidden_size: model.hidden_size,
        })
    }

    /// `input_grid` is `[batch, height, width]` of symbol ids.
    pub fn forward(&self, input_grid: &Tensor, train: bool) -> Result<(Tensor, Vec<GateCache>)> {
        let (b, h, w) = input_grid.dims3()?;
        let tok = self.tok_embed.forward(input_grid)?;
        let pos = positional::sinusoidal_2d(h, w, self.hidden_size, input_grid.device())?;
        let mut x = tok.broadcast_add(&pos)?.reshape((b, h * w, self.hidden_size))?;

        let mut caches = Vec::new();
        if let Some((ln, object_finder)) = self.object_finder.as_ref() {
            let (features, finder_caches) = object_finder.forward(&ln.forward(&x)?, None, train)?;
            x = (x + features)?;
            caches.extend(finder_caches);
        }

        for layer in &self.layers {
            let (next, block_caches) = layer.forward(&x, None, train)?;
            x = next;
            caches.extend(block_caches);
        }

        Ok((self.final_ln.forward(&x)?, caches))
    }

    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((
            format!("{prefix}.tok_embed.weight"),
            self.tok_embed_weight.clone(),
        ));
        if let Some((ln, finder)) = self.object_finder.as_ref() {
            ln.collect_vars(&format!("{prefix}.obj_finder_ln"), out);
            finder.collect_vars(&format!("{prefix}.object_finder"), out);
        }
        for (i, layer) in self.layers.iter().enumerate() {
            layer.collect_vars(&format!("{prefix}.layers.{i}"), out);
        }
        self.final_ln.collect_vars(&format!("{prefix}.final_ln"), out);
    }
}

pub struct Decoder {
    /// `[1, max_grid_size^2, hidden]` learned query bank, sliced per target.
    output_query: Var,
    layers: Vec<DynOnnBlock>,
    final_ln: NormLayer,
    lm_head_weight: Var,
    lm_head_bias: Var,
    lm_head: Linear,
    hidden_size: usize,
    vocab_size: usize,
    max_area: usize,
}

impl Decoder {
    pub fn new(
        model: &ModelKnobs,
        gating: &GatingKnobs,
        vocab_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let max_area = model.max_grid_size * model.max_grid_size;
        let output_query = Var::from_tensor(&Tensor::randn(
            0f32,
            1f32,
            (1, max_area, model.hidden_size),
            device,
        )?)?;

        let layers = (0..model.num_hidden_layers / 2)
            .map(|_| DynOnnBlock::new(model, gating, true, device))
            .collect::<Result<Vec<_>>>()?;
        let final_ln = NormLayer::new(model.hidden_size, device)?;

        let lm_head_weight = Var::from_tensor(&kaiming_uniform(
            model.hidden_size,
            (vocab_size, model.hidden_size),
            device,
        )?)?;
        let lm_head_bias =
            Var::from_tensor(&fan_in_bias(model.hidden_size, vocab_size, device)?)?;
        let lm_head = Linear::new(
            lm_head_weight.as_tensor().clone(),
            Some(lm_head_bias.as_tensor().clone()),
        );

        Ok(Self {
            output_query,
            layers,
            final_ln,
            lm_head_weight,
            lm_head_bias,
            lm_head,
            hidden_size: model.hidden_size,
            vocab_size,
            max_area,
        })
    }

    /// Produce the whole output grid non-autoregressively from the learned
    /// query bank, cross-attending into the encoder output.
    pub fn forward(
        &self,
        encoder_output: &Tensor,
        target_h: usize,
        target_w: usize,
        train: bool,
    ) -> Result<(Tensor, Vec<GateCache>)> {
        let b = encoder_output.dims3()?.0;
        let t = target_h * target_w;
        if t > self.max_area {
            candle_core::bail!(
                "target grid {}x{} exceeds the decoder's query bank capacity of {} cells",
                target_h,
                target_w,
                self.max_area
            );
        }

        let mut x = self
            .output_query
            .as_tensor()
            .narrow(1, 0, t)?
            .broadcast_as((b, t, self.hidden_size))?
            .contiguous()?;

        let mut caches = Vec::new();
        for layer in &self.layers {
            let (next, block_caches) = layer.forward(&x, Some(encoder_output), train)?;
            x = next;
            caches.extend(block_caches);
        }

        let x = self.final_ln.forward(&x)?;
        let logits = self.lm_head.forward(&x)?;
        Ok((
            logits.reshape((b, target_h, target_w, self.vocab_size))?,
            caches,
        ))
    }

    fn collect_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((format!("{prefix}.output_query"), self.output_query.clone()));
        for (i, layer) in self.layers.iter().enumerate() {
            layer.collect_vars(&format!("{prefix}.layers.{i}"), out);
        }
        self.final_ln.collect_vars(&format!("{prefix}.final_ln"), out);
        out.push((
            format!("{prefix}.lm_head.weight"),
            self.lm_head_weight.clone(),
        ));
        out.push((format!("{prefix}.lm_head.bias"), self.lm_head_bias.clone()));
    }
}

/// Encoder-decoder model over ARC grids with dynamically-gated expert layers
/// throughout.
pub struct DynOnnModel {
    pub encoder: Encoder,
    pub decoder: Decoder,
}

impl DynOnnModel {
    pub fn new(
        model: &ModelKnobs,
        gating: &GatingKnobs,
        vocab_size: usize,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            encoder: Encoder::new(model, gating, vocab_size, device)?,
            decoder: Decoder::new(model, gating, vocab_size, device)?,
        })
    }

    /// Full forward pass. The output shape is taken from `output_grid` when
    /// given (teacher forcing), otherwise from `target_hw`; providing neither
    /// is a shape error. Returns `[batch, h, w, vocab]` logits plus the
    /// ordered gate caches of every dynamic layer invocation.
    pub fn forward(
        &self,
        input_grid: &Tensor,
        output_grid: Option<&Tensor>,
        target_hw: Option<(usize, usize)>,
        train: bool,
    ) -> Result<(Tensor, Vec<GateCache>)> {
        let (target_h, target_w) = match (output_grid, target_hw) {
            (Some(output), _) => {
                let (_, h, w) = output.dims3()?;
                (h, w)
            }
            (None, Some(hw)) => hw,
            (None, None) => {
                candle_core::bail!("must provide either an output grid or target dimensions")
            }
        };

        let (encoder_output, mut caches) = self.encoder.forward(input_grid, train)?;
        let (logits, decoder_caches) =
            self.decoder
                .forward(&encoder_output, target_h, target_w, train)?;
        caches.extend(decoder_caches);
        Ok((logits, caches))
    }

    /// Regeneration sweep over every dynamic expert layer. Returns
    /// `(layer name, regenerated slot count)` per layer; call once per epoch
    /// boundary, never concurrently with a forward/backward pass.
    pub fn regenerate_dead_experts(&self) -> Result<Vec<(String, usize)>> {
        let mut report = Vec::new();
        if let Some((_, finder)) = self.encoder.object_finder.as_ref() {
            report.push((
                "encoder.object_finder".to_string(),
                finder.regenerate_dead_experts()?,
            ));
        }
        for (i, block) in self.encoder.layers.iter().enumerate() {
            for (tag, layer) in block.expert_layers() {
                report.push((
                    format!("encoder.layers.{i}.{tag}"),
                    layer.regenerate_dead_experts()?,
                ));
            }
        }
        for (i, block) in self.decoder.layers.iter().enumerate() {
            for (tag, layer) in block.expert_layers() {
                report.push((
                    format!("decoder.layers.{i}.{tag}"),
                    layer.regenerate_dead_experts()?,
                ));
            }
        }
        Ok(report)
    }

    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut out = Vec::new();
        self.encoder.collect_vars("encoder", &mut out);
        self.decoder.collect_vars("decoder", &mut out);
        out
    }

    pub fn all_vars(&self) -> Vec<Var> {
        self.named_parameters().into_iter().map(|(_, v)| v).collect()
    }

    /// The expert banks and gate parameters only, for the surprise metric.
    pub fn expert_vars(&self) -> Vec<Var> {
        self.named_parameters()
            .into_iter()
            .filter(|(name, _)| {
                name.contains(".attn.")
                    || name.contains(".moe.")
                    || name.contains(".cross_attention.")
                    || name.contains("object_finder.")
            })
            .map(|(_, v)| v)
            .collect()
    }

    pub fn export_tensors(&self) -> HashMap<String, Tensor> {
        self.named_parameters()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect()
    }

    /// Restore parameters from a checkpoint tensor map. Every parameter must
    /// be present with a matching shape.
    pub fn import_tensors(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        for (name, var) in self.named_parameters() {
            let tensor = tensors
                .get(&name)
                .ok_or_else(|| candle_core::Error::Msg(format!("missing checkpoint tensor {name}")))?;
            var.set(tensor)?;
        }
        Ok(())
    }
}
