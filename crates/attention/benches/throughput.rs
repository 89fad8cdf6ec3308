//! Throughput benchmark for grouped attention and rotary embeddings.
//! Run with: `cargo bench -p attention throughput`

#[path = "common/mod.rs"]
mod util;

use std::error::Error;
use std::time::Instant;

use attention::{grouped_query_attention, Config};
use candle_core::{DType, Device, Tensor};
use embedding::positional::rope::{apply_rotary, apply_rotary_dense, RopeConfig};
use util::{format_markdown_table, format_rate};

#[derive(Clone, Copy)]
struct Case {
    batch: usize,
    heads: usize,
    kv_heads: usize,
    seq_len: usize,
    head_dim: usize,
    dtype: DType,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("throughput bench failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let device = Device::Cpu;

    let mut cases = Vec::new();
    for &seq_len in &[128usize, 512, 2048] {
        for &kv_heads in &[8usize, 2, 1] {
            for &dtype in &[DType::F32, DType::BF16] {
                cases.push(Case {
                    batch: 1,
                    heads: 8,
                    kv_heads,
                    seq_len,
                    head_dim: 64,
                    dtype,
                });
            }
        }
    }

    let mut rows = Vec::new();
    let config = Config::default();
    for case in &cases {
        let iterations = iterations_for(case.seq_len);
        let (q, k, v) = build_inputs(&device, case)?;
        let tokens_per_iter = (case.batch * case.heads * case.seq_len) as f64;

        for _ in 0..3 {
            grouped_query_attention(&q, &k, &v, &config, None, None)?;
        }
        let start = Instant::now();
        for _ in 0..iterations {
            grouped_query_attention(&q, &k, &v, &config, None, None)?;
        }
        let per_sec = iterations as f64 / start.elapsed().as_secs_f64();
        rows.push(vec![
            "gqa".to_string(),
            format!(
                "({},{},{}/{},{})",
                case.batch, case.seq_len, case.heads, case.kv_heads, case.head_dim
            ),
            format!("{:?}", case.dtype),
            format_rate(per_sec * tokens_per_iter),
        ]);
    }

    let rope = RopeConfig::new(64);
    for &seq_len in &[128usize, 512] {
        let x = Tensor::rand(0.0f32, 1.0, (1, seq_len, 8, 64), &device)?;
        let tokens_per_iter = (8 * seq_len) as f64;
        let iterations = iterations_for(seq_len);
        for (label, dense) in [("rope-dense", true), ("rope-table", false)] {
            let start = Instant::now();
            for _ in 0..iterations {
                if dense {
                    apply_rotary_dense(&x, &rope)?;
                } else {
                    apply_rotary(&x, &rope, 0)?;
                }
            }
            let per_sec = iterations as f64 / start.elapsed().as_secs_f64();
            rows.push(vec![
                label.to_string(),
                format!("(1,{seq_len},8,64)"),
                "F32".to_string(),
                format_rate(per_sec * tokens_per_iter),
            ]);
        }
    }

    let table = format_markdown_table(
        &["kernel", "shape (b,s,h[/kv],d)", "dtype", "tokens/sec"],
        &rows,
    );
    println!("\nThroughput summary:\n{table}");
    Ok(())
}

fn iterations_for(seq_len: usize) -> usize {
    match seq_len {
        0..=128 => 100,
        129..=512 => 30,
        _ => 5,
    }
}

fn build_inputs(device: &Device, case: &Case) -> Result<(Tensor, Tensor, Tensor), Box<dyn Error>> {
    let q_shape = (case.batch, case.seq_len, case.heads, case.head_dim);
    let kv_shape = (case.batch, case.seq_len, case.kv_heads, case.head_dim);
    let q = Tensor::rand(0.0f32, 1.0, q_shape, device)?.to_dtype(case.dtype)?;
    let k = Tensor::rand(0.0f32, 1.0, kv_shape, device)?.to_dtype(case.dtype)?;
    let v = Tensor::rand(0.0f32, 1.0, kv_shape, device)?.to_dtype(case.dtype)?;
    Ok((q, k, v))
}
