mod support;

use shardflow::pass::fuse_accumulate::ACCUMULATE_ARG;
use shardflow::pass::AccumulateFusionPass;
use shardflow::{Job, OperatorConf, SbpParallel, SbpSignature};
use support::{add_matmul, add_sink, add_source, add_sum, grid, lbi, run_pass};

const S0: SbpParallel = SbpParallel::Split { axis: 0 };

/// matmul -> add_n -> sink, with the other addend from a plain source.
fn fusible_job() -> Job {
    let mut job = Job::new("fusible");
    add_source(&mut job, "x", S0);
    add_source(&mut job, "w", S0);
    add_matmul(&mut job, "mm", lbi("x", "out", 0), lbi("w", "out", 0), S0);
    add_source(&mut job, "g", S0);
    add_sum(&mut job, "sum", lbi("mm", "out", 0), lbi("g", "out", 0), S0);
    add_sink(&mut job, "sink", lbi("sum", "out", 0), S0);
    job
}

#[test]
fn fuses_sum_into_capable_producer() {
    let mut job = fusible_job();
    let summary = run_pass(&mut job, &AccumulateFusionPass);

    assert!(summary.changed());
    assert_eq!(summary.ops_added, 0);
    assert_eq!(summary.ops_replaced, 2);
    assert_eq!(summary.ops_deleted, 1);
    assert_eq!(summary.signatures_overridden, 1);

    assert!(!job.has_op("sum"));
    let mm = job.op("mm").unwrap();
    assert_eq!(mm.input(ACCUMULATE_ARG, 0), Some(&lbi("g", "out", 0)));
    let sink = job.op("sink").unwrap();
    assert_eq!(sink.input("in", 0), Some(&lbi("mm", "out", 0)));

    let sig = job.sbp_signature("mm").unwrap();
    assert_eq!(sig.sbp(ACCUMULATE_ARG, 0), Some(&S0));
    assert_eq!(sig.sbp("out", 0), Some(&S0));

    job.validate().unwrap();
}

#[test]
fn prefers_first_addend_when_both_qualify() {
    let mut job = Job::new("tie-break");
    add_source(&mut job, "x1", S0);
    add_source(&mut job, "w1", S0);
    add_matmul(&mut job, "mm1", lbi("x1", "out", 0), lbi("w1", "out", 0), S0);
    add_source(&mut job, "x2", S0);
    add_source(&mut job, "w2", S0);
    add_matmul(&mut job, "mm2", lbi("x2", "out", 0), lbi("w2", "out", 0), S0);
    add_sum(&mut job, "sum", lbi("mm1", "out", 0), lbi("mm2", "out", 0), S0);
    add_sink(&mut job, "sink", lbi("sum", "out", 0), S0);

    run_pass(&mut job, &AccumulateFusionPass);

    let mm1 = job.op("mm1").unwrap();
    assert_eq!(mm1.input(ACCUMULATE_ARG, 0), Some(&lbi("mm2", "out", 0)));
    let mm2 = job.op("mm2").unwrap();
    assert!(!mm2.has_input_arg(ACCUMULATE_ARG));
    let sink = job.op("sink").unwrap();
    assert_eq!(sink.input("in", 0), Some(&lbi("mm1", "out", 0)));
}

#[test]
fn requires_sole_consumer_of_producer_output() {
    let mut job = fusible_job();
    add_sink(&mut job, "extra", lbi("mm", "out", 0), S0);

    let before = job.clone();
    let summary = run_pass(&mut job, &AccumulateFusionPass);

    assert!(!summary.changed());
    assert_eq!(job, before);
}

#[test]
fn skips_sum_over_incapable_producers() {
    let mut job = Job::new("plain-sum");
    add_source(&mut job, "s1", S0);
    add_source(&mut job, "s2", S0);
    add_sum(&mut job, "sum", lbi("s1", "out", 0), lbi("s2", "out", 0), S0);
    add_sink(&mut job, "sink", lbi("sum", "out", 0), S0);

    let before = job.clone();
    let summary = run_pass(&mut job, &AccumulateFusionPass);

    assert!(!summary.changed());
    assert_eq!(job, before);
}

#[test]
fn skips_sum_that_declares_ctrl_deps() {
    let mut job = Job::new("ctrl-out");
    add_source(&mut job, "x", S0);
    add_source(&mut job, "w", S0);
    add_matmul(&mut job, "mm", lbi("x", "out", 0), lbi("w", "out", 0), S0);
    add_source(&mut job, "g", S0);
    let conf = OperatorConf::new("sum", "add_n")
        .with_input("in", vec![lbi("mm", "out", 0), lbi("g", "out", 0)])
        .with_output("out", 1)
        .with_ctrl_in("x");
    let sig = SbpSignature::new()
        .with_arg("in", vec![S0, S0])
        .with_arg("out", vec![S0]);
    job.add_op(conf, grid(), sig).unwrap();
    add_sink(&mut job, "sink", lbi("sum", "out", 0), S0);

    let before = job.clone();
    assert!(!run_pass(&mut job, &AccumulateFusionPass).changed());
    assert_eq!(job, before);
}

#[test]
fn skips_sum_that_is_ctrl_target() {
    let mut job = fusible_job();
    let conf = OperatorConf::new("late", "relay")
        .with_input("in", vec![lbi("g", "out", 0)])
        .with_ctrl_in("sum");
    let sig = SbpSignature::new().with_arg("in", vec![S0]);
    job.add_op(conf, grid(), sig).unwrap();

    let before = job.clone();
    assert!(!run_pass(&mut job, &AccumulateFusionPass).changed());
    assert_eq!(job, before);
}

#[test]
fn skips_sum_whose_producer_declares_ctrl_deps() {
    let mut job = Job::new("ctrl-producer");
    add_source(&mut job, "x", S0);
    add_source(&mut job, "w", S0);
    let conf = OperatorConf::new("mm", "matmul")
        .with_input("a", vec![lbi("x", "out", 0)])
        .with_input("b", vec![lbi("w", "out", 0)])
        .with_output("out", 1)
        .with_ctrl_in("x");
    let sig = SbpSignature::new()
        .with_arg("a", vec![S0])
        .with_arg("b", vec![S0])
        .with_arg("out", vec![S0]);
    job.add_op(conf, grid(), sig).unwrap();
    add_source(&mut job, "g", S0);
    add_sum(&mut job, "sum", lbi("mm", "out", 0), lbi("g", "out", 0), S0);
    add_sink(&mut job, "sink", lbi("sum", "out", 0), S0);

    let before = job.clone();
    assert!(!run_pass(&mut job, &AccumulateFusionPass).changed());
    assert_eq!(job, before);
}

#[test]
fn skips_sum_whose_producer_is_ctrl_target() {
    let mut job = fusible_job();
    let conf = OperatorConf::new("late", "relay")
        .with_input("in", vec![lbi("g", "out", 0)])
        .with_ctrl_in("mm");
    let sig = SbpSignature::new().with_arg("in", vec![S0]);
    job.add_op(conf, grid(), sig).unwrap();

    let before = job.clone();
    assert!(!run_pass(&mut job, &AccumulateFusionPass).changed());
    assert_eq!(job, before);
}

#[test]
fn skips_sum_whose_other_addend_producer_is_ctrl_target() {
    // g is never replaced, but its value would be rerouted into mm's hidden
    // input, so a control edge on g blocks the site too
    let mut job = fusible_job();
    let conf = OperatorConf::new("late", "relay")
        .with_input("in", vec![lbi("w", "out", 0)])
        .with_ctrl_in("g");
    let sig = SbpSignature::new().with_arg("in", vec![S0]);
    job.add_op(conf, grid(), sig).unwrap();

    let before = job.clone();
    assert!(!run_pass(&mut job, &AccumulateFusionPass).changed());
    assert_eq!(job, before);
}

#[test]
fn skips_sum_with_extra_input_argument() {
    // a third addend under its own argument has no slot in the binary fold
    let mut job = Job::new("extra-arg");
    add_source(&mut job, "x", S0);
    add_source(&mut job, "w", S0);
    add_matmul(&mut job, "mm", lbi("x", "out", 0), lbi("w", "out", 0), S0);
    add_source(&mut job, "g", S0);
    add_source(&mut job, "e", S0);
    let conf = OperatorConf::new("sum", "add_n")
        .with_input("in", vec![lbi("mm", "out", 0), lbi("g", "out", 0)])
        .with_input("eps", vec![lbi("e", "out", 0)])
        .with_output("out", 1);
    let sig = SbpSignature::new()
        .with_arg("in", vec![S0, S0])
        .with_arg("eps", vec![S0])
        .with_arg("out", vec![S0]);
    job.add_op(conf, grid(), sig).unwrap();
    add_sink(&mut job, "sink", lbi("sum", "out", 0), S0);

    let before = job.clone();
    assert!(!run_pass(&mut job, &AccumulateFusionPass).changed());
    assert_eq!(job, before);
}

#[test]
fn skips_sum_with_extra_output_slot() {
    let mut job = Job::new("extra-slot");
    add_source(&mut job, "x", S0);
    add_source(&mut job, "w", S0);
    add_matmul(&mut job, "mm", lbi("x", "out", 0), lbi("w", "out", 0), S0);
    add_source(&mut job, "g", S0);
    let conf = OperatorConf::new("sum", "add_n")
        .with_input("in", vec![lbi("mm", "out", 0), lbi("g", "out", 0)])
        .with_output("out", 2);
    let sig = SbpSignature::new()
        .with_arg("in", vec![S0, S0])
        .with_arg("out", vec![S0, S0]);
    job.add_op(conf, grid(), sig).unwrap();
    add_sink(&mut job, "sink", lbi("sum", "out", 0), S0);
    add_sink(&mut job, "aux", lbi("sum", "out", 1), S0);

    let before = job.clone();
    assert!(!run_pass(&mut job, &AccumulateFusionPass).changed());
    assert_eq!(job, before);
}

#[test]
fn skips_producer_that_already_accumulates() {
    let mut job = Job::new("already-fused");
    add_source(&mut job, "x", S0);
    add_source(&mut job, "w", S0);
    add_source(&mut job, "g0", S0);
    let conf = OperatorConf::new("mm", "matmul")
        .with_input("a", vec![lbi("x", "out", 0)])
        .with_input("b", vec![lbi("w", "out", 0)])
        .with_input(ACCUMULATE_ARG, vec![lbi("g0", "out", 0)])
        .with_output("out", 1);
    let sig = SbpSignature::new()
        .with_arg("a", vec![S0])
        .with_arg("b", vec![S0])
        .with_arg(ACCUMULATE_ARG, vec![S0])
        .with_arg("out", vec![S0]);
    job.add_op(conf, grid(), sig).unwrap();
    add_source(&mut job, "g1", S0);
    add_sum(&mut job, "sum", lbi("mm", "out", 0), lbi("g1", "out", 0), S0);
    add_sink(&mut job, "sink", lbi("sum", "out", 0), S0);

    let before = job.clone();
    assert!(!run_pass(&mut job, &AccumulateFusionPass).changed());
    assert_eq!(job, before);
}

#[test]
fn rewires_every_consumer_of_the_sum() {
    let mut job = fusible_job();
    add_sink(&mut job, "sink2", lbi("sum", "out", 0), S0);

    let summary = run_pass(&mut job, &AccumulateFusionPass);

    assert_eq!(summary.ops_replaced, 3);
    for name in ["sink", "sink2"] {
        let sink = job.op(name).unwrap();
        assert_eq!(sink.input("in", 0), Some(&lbi("mm", "out", 0)));
    }
}

#[test]
fn fusion_is_idempotent() {
    let mut job = fusible_job();
    assert!(run_pass(&mut job, &AccumulateFusionPass).changed());

    let after_first = job.clone();
    let second = run_pass(&mut job, &AccumulateFusionPass);

    assert!(!second.changed());
    assert_eq!(job, after_first);
}

#[test]
fn defers_sum_whose_consumer_fused_away_this_run() {
    let mut job = Job::new("reverse-order");
    add_source(&mut job, "x1", S0);
    add_source(&mut job, "w1", S0);
    add_matmul(&mut job, "mm1", lbi("x1", "out", 0), lbi("w1", "out", 0), S0);
    add_source(&mut job, "g", S0);
    add_source(&mut job, "x2", S0);
    add_source(&mut job, "w2", S0);
    add_matmul(&mut job, "mm2", lbi("x2", "out", 0), lbi("w2", "out", 0), S0);
    // downstream sum inserted first so a single run visits it before sum1
    add_sum(&mut job, "sum2", lbi("sum1", "out", 0), lbi("mm2", "out", 0), S0);
    add_sum(&mut job, "sum1", lbi("mm1", "out", 0), lbi("g", "out", 0), S0);
    add_sink(&mut job, "sink", lbi("sum2", "out", 0), S0);

    // First run folds sum2 into mm2; sum1 must wait because its sole
    // consumer was deleted within the run.
    assert!(run_pass(&mut job, &AccumulateFusionPass).changed());
    assert!(!job.has_op("sum2"));
    assert!(job.has_op("sum1"));
    let mm2 = job.op("mm2").unwrap();
    assert_eq!(mm2.input(ACCUMULATE_ARG, 0), Some(&lbi("sum1", "out", 0)));
    job.validate().unwrap();

    // Second run folds sum1 into mm1 and mm2's hidden input follows it.
    assert!(run_pass(&mut job, &AccumulateFusionPass).changed());
    assert!(!job.has_op("sum1"));
    let mm2 = job.op("mm2").unwrap();
    assert_eq!(mm2.input(ACCUMULATE_ARG, 0), Some(&lbi("mm1", "out", 0)));
    job.validate().unwrap();
}

#[test]
fn chained_sums_collapse_over_repeated_runs() {
    let mut job = Job::new("chained");
    add_source(&mut job, "x1", S0);
    add_source(&mut job, "w1", S0);
    add_matmul(&mut job, "mm1", lbi("x1", "out", 0), lbi("w1", "out", 0), S0);
    add_source(&mut job, "g", S0);
    add_sum(&mut job, "sum1", lbi("mm1", "out", 0), lbi("g", "out", 0), S0);
    add_source(&mut job, "x2", S0);
    add_source(&mut job, "w2", S0);
    add_matmul(&mut job, "mm2", lbi("x2", "out", 0), lbi("w2", "out", 0), S0);
    add_sum(&mut job, "sum2", lbi("sum1", "out", 0), lbi("mm2", "out", 0), S0);
    add_sink(&mut job, "sink", lbi("sum2", "out", 0), S0);

    // First run folds sum1 into mm1 and reroutes sum2 onto mm1's output.
    assert!(run_pass(&mut job, &AccumulateFusionPass).changed());
    assert!(!job.has_op("sum1"));
    let sum2 = job.op("sum2").unwrap();
    assert_eq!(sum2.input("in", 0), Some(&lbi("mm1", "out", 0)));

    // Second run cannot reuse mm1, so sum2 folds into mm2 instead.
    assert!(run_pass(&mut job, &AccumulateFusionPass).changed());
    assert!(!job.has_op("sum2"));
    let mm2 = job.op("mm2").unwrap();
    assert_eq!(mm2.input(ACCUMULATE_ARG, 0), Some(&lbi("mm1", "out", 0)));
    let sink = job.op("sink").unwrap();
    assert_eq!(sink.input("in", 0), Some(&lbi("mm2", "out", 0)));

    assert!(!run_pass(&mut job, &AccumulateFusionPass).changed());
    job.validate().unwrap();
}
