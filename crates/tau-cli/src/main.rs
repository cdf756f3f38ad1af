//! taufit CLI

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tau_core::{Channel, Context, LikelihoodModel};
use tau_hist::{DirectorySource, ShapeFile};
use tau_inference::{
    BinnedModel, FitDriver, FitOptions, ParabolaOptions, Prior, ScanTree, UnfoldMethod, Unfolder, UnfoldingConfig,
    UnfoldingInput, fit_parabola, load_shapes, widened_range,
};
use tau_translate::{AnalysisSetup, Datacard, DatacardBuilder, TemplateBuilder, check_shapes};
use tau_viz::{MeasurementTable, PostFitReader, PullOrder};

mod args;

use args::{parse_freeze, parse_range, parse_set_range};

#[derive(Parser)]
#[command(name = "taufit")]
#[command(about = "taufit - tau energy-scale and ID fits, Z-pT unfolding")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    /// Raise the log level to debug
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Validate inputs and print the plan without writing anything
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the shapes file of each observable
    Templates {
        /// Analysis setup (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Data-taking era (e.g. UL2018)
        #[arg(short, long)]
        era: String,

        /// Channel, overriding the setup's
        #[arg(long)]
        channel: Option<String>,

        /// Luminosity in fb^-1 for eras without a default
        #[arg(long)]
        lumi: Option<f64>,

        /// Observables (all when omitted)
        #[arg(long, value_delimiter = ',')]
        observable: Vec<String>,

        /// Region patterns (regex) to keep
        #[arg(long, value_delimiter = ',')]
        regions: Vec<String>,

        /// Output tag, overriding the setup's
        #[arg(long)]
        tag: Option<String>,

        /// Directory with the event inputs
        #[arg(long)]
        indir: PathBuf,

        /// Output directory
        #[arg(long, default_value = "input")]
        outdir: PathBuf,

        /// Threads (0 = auto)
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Check Up/Down shape templates against their nominal
    CheckShapes {
        /// Shapes file
        #[arg(long)]
        shapes: PathBuf,

        /// Fail when a check does not pass
        #[arg(long)]
        strict: bool,
    },

    /// Assemble datacards from a shapes file
    Datacard {
        /// Analysis setup (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Data-taking era
        #[arg(short, long)]
        era: String,

        /// Channel, overriding the setup's
        #[arg(long)]
        channel: Option<String>,

        /// Luminosity in fb^-1 for eras without a default
        #[arg(long)]
        lumi: Option<f64>,

        /// Observable
        #[arg(long)]
        observable: String,

        /// Region patterns (regex) to keep
        #[arg(long, value_delimiter = ',')]
        regions: Vec<String>,

        /// Output tag, overriding the setup's
        #[arg(long)]
        tag: Option<String>,

        /// Directory with the shapes file
        #[arg(long, default_value = "input")]
        indir: PathBuf,

        /// Output directory (defaults to the input directory)
        #[arg(long)]
        outdir: Option<PathBuf>,

        /// Write one combined card instead of one per region
        #[arg(long)]
        combine: bool,
    },

    /// Fit a datacard
    Fit {
        /// Datacard
        #[arg(long)]
        card: PathBuf,

        /// What to run
        #[arg(long, value_enum, default_value = "scan")]
        mode: FitMode,

        /// Parameter of interest
        #[arg(long)]
        poi: String,

        /// Scan points
        #[arg(long, default_value = "41")]
        points: usize,

        /// Scan range `lo:hi` (the POI bounds by default)
        #[arg(long, value_parser = parse_range)]
        range: Option<(f64, f64)>,

        /// Freeze `name` or `name=value`
        #[arg(long, value_parser = parse_freeze)]
        freeze: Vec<(String, Option<f64>)>,

        /// Parameter range `name=lo:hi`
        #[arg(long, value_parser = parse_set_range)]
        set_range: Vec<(String, f64, f64)>,

        /// Fit the expectation at the initial parameters instead of the data
        #[arg(long)]
        asimov: bool,

        /// Number of toys (mode toys)
        #[arg(long, default_value = "100")]
        toys: usize,

        /// First toy seed
        #[arg(long, default_value = "123456")]
        seed: u64,

        /// Output directory
        #[arg(long, default_value = "output")]
        outdir: PathBuf,
    },

    /// Interval of a POI from a scan tree
    Parabola {
        /// Fit-result tree
        #[arg(long)]
        tree: PathBuf,

        /// Expected POI name
        #[arg(long)]
        poi: Option<String>,

        /// Cubic term for asymmetric errors
        #[arg(long)]
        asymmetric: bool,

        /// Measurement table to add the result to
        #[arg(long, requires = "category")]
        measurements: Option<PathBuf>,

        /// Category of the result in the measurement table
        #[arg(long)]
        category: Option<String>,

        /// Output directory
        #[arg(long, default_value = "plots")]
        outdir: PathBuf,
    },

    /// Unfold a reco-level distribution to generator level
    Unfold {
        /// Unfolding input (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Bayesian iterations
        #[arg(long, default_value = "4", allow_negative_numbers = true)]
        iterations: i32,

        /// Method
        #[arg(long, value_enum, default_value = "bayes")]
        method: MethodArg,

        /// Prior of the first iteration
        #[arg(long, value_enum, default_value = "simulation")]
        prior: PriorArg,

        /// Output directory
        #[arg(long, default_value = "weights")]
        outdir: PathBuf,
    },

    /// Read parameters, correlations and chunks from a scan tree
    Postfit {
        /// Fit-result tree
        #[arg(long)]
        tree: PathBuf,

        /// Expected POI name
        #[arg(long)]
        poi: Option<String>,

        /// Parameters to read (tracked parameters without bin-by-bin ones by default)
        #[arg(long, value_delimiter = ',')]
        params: Vec<String>,

        /// Bin-by-bin parameter pattern (`*` wildcard)
        #[arg(long)]
        bbb: Option<String>,

        /// Correlation matrix order
        #[arg(long, value_enum, default_value = "name")]
        order: OrderArg,

        /// Cubic term for asymmetric errors
        #[arg(long)]
        asymmetric: bool,

        /// Tag of the fit-values file
        #[arg(long, default_value = "")]
        tag: String,

        /// Era label of the fit-values file
        #[arg(long, default_value = "UL2018-13TeV")]
        era: String,

        /// Region of the fit-values file
        #[arg(long, default_value = "all")]
        region: String,

        /// Output directory
        #[arg(long, default_value = "plots")]
        outdir: PathBuf,
    },

    /// Export a measurement table as a correction-library JSON
    ExportCorrections {
        /// Measurement table
        #[arg(long)]
        measurements: PathBuf,

        /// Working point
        #[arg(long)]
        wp: String,

        /// Correction name
        #[arg(long, default_value = "tau_energy_scale")]
        name: String,

        /// Output directory
        #[arg(long, default_value = "corrections")]
        outdir: PathBuf,
    },

    /// Print version information
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FitMode {
    Scan,
    BestFit,
    Postfit,
    Toys,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MethodArg {
    Bayes,
    BinByBin,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorArg {
    Simulation,
    Uniform,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrderArg {
    Name,
    Sigma,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose && cli.log_level != tracing::Level::TRACE { tracing::Level::DEBUG } else { cli.log_level };
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    let dry_run = cli.dry_run;
    match cli.command {
        Commands::Templates {
            config,
            era,
            channel,
            lumi,
            observable,
            regions,
            tag,
            indir,
            outdir,
            threads,
        } => cmd_templates(
            &config,
            &era,
            channel.as_deref(),
            lumi,
            &observable,
            &regions,
            tag,
            &indir,
            &outdir,
            threads,
            dry_run,
        ),
        Commands::CheckShapes { shapes, strict } => cmd_check_shapes(&shapes, strict),
        Commands::Datacard {
            config,
            era,
            channel,
            lumi,
            observable,
            regions,
            tag,
            indir,
            outdir,
            combine,
        } => {
            let outdir = outdir.unwrap_or_else(|| indir.clone());
            cmd_datacard(
                &config,
                &era,
                channel.as_deref(),
                lumi,
                &observable,
                &regions,
                tag,
                &indir,
                &outdir,
                combine,
                dry_run,
            )
        }
        Commands::Fit { card, mode, poi, points, range, freeze, set_range, asimov, toys, seed, outdir } => {
            let options = FitOptions { frozen: freeze, ranges: set_range, asimov, ..FitOptions::default() };
            cmd_fit(&card, mode, &poi, points, range, options, toys, seed, &outdir, dry_run)
        }
        Commands::Parabola { tree, poi, asymmetric, measurements, category, outdir } => cmd_parabola(
            &tree,
            poi.as_deref(),
            asymmetric,
            measurements.as_deref(),
            category.as_deref(),
            &outdir,
            dry_run,
        ),
        Commands::Unfold { input, iterations, method, prior, outdir } => {
            let config = UnfoldingConfig {
                method: match method {
                    MethodArg::Bayes => UnfoldMethod::Bayes,
                    MethodArg::BinByBin => UnfoldMethod::BinByBin,
                },
                iterations,
                prior: match prior {
                    PriorArg::Simulation => Prior::Simulation,
                    PriorArg::Uniform => Prior::Uniform,
                },
                ..UnfoldingConfig::default()
            };
            cmd_unfold(&input, config, &outdir, dry_run)
        }
        Commands::Postfit { tree, poi, params, bbb, order, asymmetric, tag, era, region, outdir } => {
            let order = match order {
                OrderArg::Name => PullOrder::Name,
                OrderArg::Sigma => PullOrder::Sigma,
            };
            cmd_postfit(
                &tree,
                poi.as_deref(),
                &params,
                bbb.as_deref(),
                order,
                asymmetric,
                (&tag, &era, &region),
                &outdir,
                dry_run,
            )
        }
        Commands::ExportCorrections { measurements, wp, name, outdir } => {
            cmd_export_corrections(&measurements, &wp, &name, &outdir, dry_run)
        }
        Commands::Version => {
            println!("taufit {}", tau_core::VERSION);
            Ok(())
        }
    }
}

fn load_setup(config: &Path, channel: Option<&str>, regions: &[String], tag: Option<String>) -> Result<AnalysisSetup> {
    let mut setup = AnalysisSetup::from_path(config)?;
    if let Some(ch) = channel {
        setup.channel = ch.to_string();
    }
    if let Some(tag) = tag {
        setup.tag = tag;
    }
    setup.restrict_regions(regions)?;
    setup.validate()?;
    Ok(setup)
}

fn analysis_context(setup: &AnalysisSetup, era: &str, lumi: Option<f64>) -> Result<Context> {
    let channel: Channel = setup.channel()?;
    Ok(match lumi {
        Some(l) => Context::new(era, l, channel),
        None => Context::from_era(era, channel)?,
    })
}

fn shapes_file_name(setup: &AnalysisSetup, ctx: &Context, observable: &str) -> String {
    ShapeFile::file_name(&setup.analysis, ctx.channel.short(), observable, &ctx.era_label(), &setup.tag)
}

#[allow(clippy::too_many_arguments)]
fn cmd_templates(
    config: &Path,
    era: &str,
    channel: Option<&str>,
    lumi: Option<f64>,
    observables: &[String],
    regions: &[String],
    tag: Option<String>,
    indir: &Path,
    outdir: &Path,
    threads: usize,
    dry_run: bool,
) -> Result<()> {
    let setup = load_setup(config, channel, regions, tag)?;
    let ctx = analysis_context(&setup, era, lumi)?;
    let source = DirectorySource::new(indir);
    let builder = TemplateBuilder::new(&setup, &ctx, &source).threads(threads);

    let observables: Vec<String> = if observables.is_empty() {
        setup.observables.keys().map(str::to_string).collect()
    } else {
        observables.to_vec()
    };

    for observable in &observables {
        let plan = builder.plan(observable)?;
        let path = outdir.join(builder.file_name(observable));
        if dry_run {
            println!("{} -> {}", observable, path.display());
            for region in &plan.regions {
                println!("  {}: {} templates, {} fills", region.region, region.template_names().len(), region.n_fills());
            }
            continue;
        }
        let file = builder.execute(&plan)?;
        file.write(&path)?;
        if !file.meta.complete {
            tracing::warn!(path = %path.display(), "shapes file is incomplete");
        }
        tracing::info!(stage = "templates", observable = %observable, path = %path.display(), "wrote shapes");
        println!("{}", path.display());
    }
    Ok(())
}

fn cmd_check_shapes(shapes: &Path, strict: bool) -> Result<()> {
    let file = ShapeFile::read(shapes)?;
    let checks = check_shapes(&file);
    let mut failed = 0usize;
    for c in &checks {
        let ok = c.passed();
        if !ok {
            failed += 1;
        }
        println!(
            "{:<12} {:<16} {:<24} up {:>8.4} down {:>8.4} {}{}",
            c.region,
            c.process,
            c.nuisance,
            c.relative(c.up),
            c.relative(c.down),
            if ok { "ok" } else { "FAILED" },
            if c.has_empty_variation() { " (empty variation, dropped)" } else { "" },
        );
    }
    println!("{} checks, {} failed", checks.len(), failed);
    if strict && failed > 0 {
        bail!("{failed} shape checks failed in {}", shapes.display());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_datacard(
    config: &Path,
    era: &str,
    channel: Option<&str>,
    lumi: Option<f64>,
    observable: &str,
    regions: &[String],
    tag: Option<String>,
    indir: &Path,
    outdir: &Path,
    combine: bool,
    dry_run: bool,
) -> Result<()> {
    let setup = load_setup(config, channel, regions, tag)?;
    let ctx = analysis_context(&setup, era, lumi)?;
    let name = shapes_file_name(&setup, &ctx, observable);
    let shapes_path = indir.join(&name);
    let file = ShapeFile::read(&shapes_path)?;
    let shapes_ref = if indir == outdir { name.clone() } else { shapes_path.display().to_string() };
    let builder = DatacardBuilder::new(&setup, shapes_ref);

    let fit_regions = setup.fit_regions(observable)?;
    let mut selected = Vec::new();
    for region in fit_regions.iter().filter(|r| setup.regions.contains_key(r)) {
        selected.push(
            file.region(region)
                .with_context(|| format!("region '{region}' is missing from {}", shapes_path.display()))?,
        );
    }
    if selected.is_empty() {
        bail!("no fit region of '{observable}' left to write");
    }

    let stem = format!("{}_{}_{}", setup.analysis, ctx.channel.short(), observable);
    let mut cards = Vec::new();
    if combine {
        let card = builder.build_combined(&selected)?;
        cards.push((outdir.join(format!("{stem}-combined{}-{}.txt", setup.tag, ctx.era_label())), card));
    } else {
        for shapes in &selected {
            let card = builder.build(shapes)?;
            cards.push((outdir.join(format!("{stem}-{}{}-{}.txt", shapes.name, setup.tag, ctx.era_label())), card));
        }
    }

    for (path, card) in &cards {
        if dry_run {
            println!("{} ({} bins, {} nuisances)", path.display(), card.bins().len(), card.nuisances.len());
            continue;
        }
        card.write(path)?;
        tracing::info!(stage = "datacard", path = %path.display(), "wrote datacard");
        println!("{}", path.display());
    }
    Ok(())
}

fn card_stem(card: &Path) -> String {
    card.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "card".to_string())
}

fn load_model(card_path: &Path) -> Result<BinnedModel> {
    tracing::info!(path = %card_path.display(), "loading datacard");
    let card = Datacard::read(card_path)?;
    let base = card_path.parent().unwrap_or_else(|| Path::new("."));
    let store = load_shapes(&card, base)?;
    let model = BinnedModel::from_card(&card, &store)?;
    tracing::info!(parameters = model.n_parameters(), "model built");
    Ok(model)
}

#[allow(clippy::too_many_arguments)]
fn cmd_fit(
    card: &Path,
    mode: FitMode,
    poi: &str,
    points: usize,
    range: Option<(f64, f64)>,
    options: FitOptions,
    toys: usize,
    seed: u64,
    outdir: &Path,
    dry_run: bool,
) -> Result<()> {
    let model = load_model(card)?;
    if model.parameter_index(poi).is_none() {
        bail!("POI '{poi}' is not a parameter of {} ({:?})", card.display(), model.parameter_names());
    }
    let stem = card_stem(card);
    if dry_run {
        println!("{:?} of {poi} in {} with {} parameters", mode, card.display(), model.n_parameters());
        return Ok(());
    }
    let driver = FitDriver::new(model, options)?;

    match mode {
        FitMode::Scan => {
            let tree = driver.scan(poi, points, range)?;
            let path = outdir.join(format!("higgsCombine.{stem}.{poi}.MultiDimFit.json"));
            tree.write(&path)?;
            if !tree.invalid_points.is_empty() {
                tracing::warn!(poi, n = tree.invalid_points.len(), "scan points failed to minimize");
            }
            println!("{}", path.display());
        }
        FitMode::BestFit => {
            let best = driver.best_fit(poi)?;
            let path = outdir.join(format!("fit_{stem}_{poi}.json"));
            best.write(&path)?;
            let m = best.interval;
            println!("{poi} = {:.4} -{:.4} +{:.4}", m.value, m.err_down, m.err_up);
        }
        FitMode::Postfit => {
            let best = driver.best_fit(poi)?;
            best.write(&outdir.join(format!("fit_{stem}_{poi}.json")))?;
            let shapes = driver.postfit_shapes(&best.result)?;
            shapes.write(&outdir.join(format!("postfit_{stem}.shapes.json")))?;
            let pulls = tau_viz::pulls_artifact(driver.model().parameters(), &best, PullOrder::Name)?;
            pulls.write(&outdir.join(format!("pulls_{stem}_{poi}.json")))?;
            for stack in tau_viz::stacks(&shapes)? {
                let stage = match stack.stage {
                    tau_viz::FitStage::Prefit => "prefit",
                    tau_viz::FitStage::Postfit => "postfit",
                };
                stack.write(&outdir.join(format!("stack_{stem}_{}_{stage}.json", stack.region)))?;
            }
            match tau_viz::CorrelationMatrix::from_fit(&best.result) {
                Ok(corr) => corr.write(&outdir.join(format!("corr_{stem}_{poi}.json")))?,
                Err(e) => tracing::warn!(error = %e, "correlation matrix skipped"),
            }
            println!("{}", outdir.display());
        }
        FitMode::Toys => {
            let best = driver.best_fit(poi)?;
            let results = driver.toys(poi, &best.result.parameters, toys, seed)?;
            let path = outdir.join(format!("toys_{stem}_{poi}.json"));
            results.write(&path)?;
            println!("{} ({} of {toys} toys converged)", path.display(), results.converged.iter().filter(|c| **c).count());
        }
    }
    Ok(())
}

fn read_tree(path: &Path, poi: Option<&str>) -> Result<ScanTree> {
    let tree = ScanTree::read(path)?;
    if let Some(poi) = poi
        && tree.poi != poi
    {
        bail!("tree {} scans '{}', not '{poi}'", path.display(), tree.poi);
    }
    if !tree.complete {
        tracing::warn!(path = %path.display(), "fit tree is incomplete");
    }
    Ok(tree)
}

fn cmd_parabola(
    tree_path: &Path,
    poi: Option<&str>,
    asymmetric: bool,
    measurements: Option<&Path>,
    category: Option<&str>,
    outdir: &Path,
    dry_run: bool,
) -> Result<()> {
    let tree = read_tree(tree_path, poi)?;
    let points = tree.points()?;
    let result = fit_parabola(&points, &ParabolaOptions { asymmetric, ..ParabolaOptions::default() })?;
    let m = result.measurement;
    println!("{} = {:.4} -{:.4} +{:.4} ({:?}, {} points)", tree.poi, m.value, m.err_down, m.err_up, result.method, result.n_points);
    if result.at_boundary
        && let Some((lo, hi)) = widened_range(&points, &result)
    {
        println!("minimum at the scan boundary, rerun with --range {lo}:{hi}");
    }
    if dry_run {
        return Ok(());
    }

    let path = outdir.join(format!("parabola_{}.json", tree.poi));
    std::fs::create_dir_all(outdir)?;
    std::fs::write(&path, serde_json::to_string_pretty(&result)?)?;

    if let (Some(table_path), Some(category)) = (measurements, category) {
        let mut table =
            if table_path.exists() { MeasurementTable::read(table_path)? } else { MeasurementTable::new(&tree.poi) };
        table.insert(category, m);
        table.write(table_path)?;
        tracing::info!(path = %table_path.display(), category, "measurement recorded");
    }
    Ok(())
}

fn cmd_unfold(input: &Path, config: UnfoldingConfig, outdir: &Path, dry_run: bool) -> Result<()> {
    let input = UnfoldingInput::read(input)?;
    if dry_run {
        println!(
            "{}: {:?} with {} iterations, {} reco x {} gen bins",
            input.name,
            config.method,
            config.iterations,
            input.response.n_reco(),
            input.response.n_gen()
        );
        return Ok(());
    }
    let result = Unfolder::new(config).run(&input)?;
    let path = outdir.join(format!("{}_weights.json", input.name));
    result.write(&path)?;
    if result.n_clipped > 0 {
        tracing::info!(n = result.n_clipped, "weights clipped");
    }
    println!("{}", path.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_postfit(
    tree_path: &Path,
    poi: Option<&str>,
    params: &[String],
    bbb: Option<&str>,
    order: PullOrder,
    asymmetric: bool,
    (tag, era, region): (&str, &str, &str),
    outdir: &Path,
    dry_run: bool,
) -> Result<()> {
    let tree = read_tree(tree_path, poi)?;
    let reader = PostFitReader::new(&tree, &ParabolaOptions { asymmetric, ..ParabolaOptions::default() })?;
    let names: Vec<String> = if params.is_empty() {
        tree.tracked.iter().filter(|n| !n.starts_with("prop_bin")).cloned().collect()
    } else {
        params.to_vec()
    };

    let records = reader.records(&names);
    for r in &records {
        let corr = r.correlation.map_or_else(|| "-".to_string(), |c| format!("{c:+.3}"));
        println!("{:<32} {:>10.4} {:>10.4} {:>8}", r.name, r.value, r.error, corr);
    }
    if dry_run {
        return Ok(());
    }

    let poi = tree.poi.as_str();
    let json = |name: String, value: serde_json::Value| -> Result<()> {
        let path = outdir.join(name);
        std::fs::write(&path, serde_json::to_string_pretty(&value)?)?;
        Ok(())
    };
    std::fs::create_dir_all(outdir)?;
    let mut summary = serde_json::json!({ "poi": poi, "records": records });
    if reader.interval().is_some() {
        summary["measurement"] = serde_json::to_value(reader.measurement())?;
        summary["window"] = serde_json::to_value(reader.window())?;
        summary["curves"] = serde_json::to_value(reader.curves(&names)?)?;
    }
    json(format!("params_{poi}.json"), summary)?;
    reader
        .correlation_matrix(&names, matches!(order, PullOrder::Sigma))
        .write(&outdir.join(format!("corr_{poi}.json")))?;
    if bbb.is_some() && reader.interval().is_none() {
        tracing::warn!(poi, "no POI interval, bin-by-bin curves skipped");
    } else if let Some(pattern) = bbb {
        let chunks = tau_viz::bbb_chunks(&tree, pattern)?;
        let curves = chunks
            .iter()
            .map(|chunk| {
                let names: Vec<String> =
                    chunk.iter().map(|b| b.trim_start_matches(tau_inference::tree::TRACKED_PREFIX).to_string()).collect();
                reader.curves(&names)
            })
            .collect::<tau_core::Result<Vec<_>>>()?;
        json(format!("bbb_{poi}.json"), serde_json::json!({ "chunks": chunks, "curves": curves }))?;
    }
    let values_path = outdir.join(tau_viz::fit_values_file_name(tag, era, region));
    tau_viz::write_fit_values(&values_path, &reader.fit_values(&names))?;
    println!("{}", values_path.display());
    Ok(())
}

fn cmd_export_corrections(measurements: &Path, wp: &str, name: &str, outdir: &Path, dry_run: bool) -> Result<()> {
    let table = MeasurementTable::read(measurements)?;
    let set = tau_viz::correction_set(&table, name, wp)?;
    let path = outdir.join(format!("{name}_{wp}.json"));
    if dry_run {
        println!("{} ({} categories)", path.display(), table.rows.len());
        return Ok(());
    }
    set.write(&path)?;
    println!("{}", path.display());
    Ok(())
}
