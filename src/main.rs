use clap::{Parser, ValueEnum};

use sweep::harness::{self, EntropyPreset};
use sweep::{GpuContext, KeyType, SortConfig, SortError, SortOrder, SortVariant, VariantPolicy};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VariantArg {
    Auto,
    Onesweep,
    DeviceRadix,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KeyArg {
    U32,
    I32,
    F32,
}

/// Validates and times the GPU radix sort on the default adapter.
#[derive(Parser, Debug)]
#[command(name = "sort_bench")]
struct Args {
    #[arg(long, value_enum, default_value_t = VariantArg::Auto)]
    variant: VariantArg,

    #[arg(long, value_enum, default_value_t = KeyArg::U32)]
    key_type: KeyArg,

    #[arg(long)]
    descending: bool,

    #[arg(long)]
    keys_only: bool,

    /// Skip the validation schedule.
    #[arg(long)]
    no_tests: bool,

    /// Step between sizes in the PARTITION_SIZE..=2*PARTITION_SIZE sweep.
    #[arg(long, default_value_t = 1)]
    stride: u32,

    /// Caps workgroups per grid dimension to force grid reshaping.
    #[arg(long)]
    max_workgroups: Option<u32>,

    /// Device memory the validation schedule may use; larger sizes are skipped.
    #[arg(long, default_value_t = 4096)]
    memory_budget_mib: u64,

    /// Keys per timed sort.
    #[arg(long, default_value_t = 1 << 22)]
    size: u32,

    /// Timed sorts per entropy preset; 0 skips timing.
    #[arg(long, default_value_t = 0)]
    batch: u32,

    /// Entropy preset 1..=5; all presets when omitted.
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    entropy: Option<u8>,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

impl Args {
    fn config(&self) -> SortConfig {
        let mut config = SortConfig::default()
            .with_variant(match self.variant {
                VariantArg::Auto => VariantPolicy::Auto,
                VariantArg::Onesweep => VariantPolicy::Require(SortVariant::OneSweep),
                VariantArg::DeviceRadix => VariantPolicy::Require(SortVariant::DeviceRadix),
            })
            .with_key_type(match self.key_type {
                KeyArg::U32 => KeyType::U32,
                KeyArg::I32 => KeyType::I32,
                KeyArg::F32 => KeyType::F32,
            })
            .with_order(if self.descending {
                SortOrder::Descending
            } else {
                SortOrder::Ascending
            });
        if self.keys_only {
            config.mode = sweep::SortMode::KeysOnly;
        }
        if let Some(max) = self.max_workgroups {
            config = config.with_max_workgroups_per_dimension(max);
        }
        config
    }
}

/// Returns whether every validation passed.
async fn run(args: Args) -> Result<bool, SortError> {
    let context = GpuContext::new().await?;
    let caps = &context.capabilities;
    println!("Adapter:            {}", caps.adapter_name);
    println!("Subgroup width:     {}..{}", caps.min_width, caps.max_width);
    println!("Subgroup ops:       {}", caps.has_wave_intrinsics);
    println!("16-bit types:       {}", caps.has_16bit_types);
    println!("Software adapter:   {}", caps.is_software);
    println!("DeviceRadix:        {}", caps.supports_base_variant);
    println!("OneSweep:           {}", caps.supports_one_sweep);
    println!("Max binding bytes:  {}", caps.max_binding_bytes);

    let config = args.config();
    let mut ok = true;

    if !args.no_tests {
        let summary = harness::test_all(&context, config.clone(), args.stride, args.memory_budget_mib << 20).await?;
        println!(
            "{} / {} tests passed, {} skipped for device limits {:?}",
            summary.passed,
            summary.expected,
            summary.skipped.len(),
            summary.skipped
        );
        ok &= summary.all_passed();
    }

    if args.batch > 0 {
        let presets: Vec<EntropyPreset> = match args.entropy.and_then(EntropyPreset::from_level) {
            Some(preset) => vec![preset],
            None => EntropyPreset::all().to_vec(),
        };
        for preset in presets {
            let stats = harness::batch_timing(&context, config.clone(), args.size, args.batch, args.seed, preset).await?;
            println!(
                "{:>10} keys  entropy {:.3}  mean {:8.3} ms  min {:8.3}  median {:8.3}  p95 {:8.3}  max {:8.3}  {:8.1} Mkeys/s",
                stats.size,
                preset.bit_entropy(),
                stats.mean_ms,
                stats.min_ms,
                stats.median_ms,
                stats.p95_ms,
                stats.max_ms,
                stats.mkeys_per_sec
            );
        }
    }

    Ok(ok)
}

fn main() {
    env_logger::init();
    match futures::executor::block_on(run(Args::parse())) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("sort_bench: {}", e);
            std::process::exit(2);
        }
    }
}
