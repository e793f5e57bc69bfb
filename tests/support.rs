use shardflow::job::AttrValue;
use shardflow::{
    CommitSummary, DeviceTag, Job, JobBuilder, JobPass, Lbi, OpGraph, OperatorConf, ParallelDesc,
    SbpParallel, SbpSignature,
};

/// Two-device placement shared by fixture operators.
pub fn grid() -> ParallelDesc {
    ParallelDesc::linear(DeviceTag::Cuda, 0, 2)
}

pub fn lbi(op_name: &str, arg: &str, index: u32) -> Lbi {
    Lbi::new(op_name, arg, index)
}

pub fn add_source(job: &mut Job, name: &str, sbp: SbpParallel) {
    job.add_op(
        OperatorConf::new(name, "source").with_output("out", 1),
        grid(),
        SbpSignature::new().with_arg("out", vec![sbp]),
    )
    .expect("add source op");
}

pub fn add_matmul(job: &mut Job, name: &str, a: Lbi, b: Lbi, sbp: SbpParallel) {
    let conf = OperatorConf::new(name, "matmul")
        .with_input("a", vec![a])
        .with_input("b", vec![b])
        .with_output("out", 1);
    let sig = SbpSignature::new()
        .with_arg("a", vec![sbp])
        .with_arg("b", vec![sbp])
        .with_arg("out", vec![sbp]);
    job.add_op(conf, grid(), sig).expect("add matmul op");
}

pub fn add_sum(job: &mut Job, name: &str, lhs: Lbi, rhs: Lbi, sbp: SbpParallel) {
    let conf = OperatorConf::new(name, "add_n")
        .with_input("in", vec![lhs, rhs])
        .with_output("out", 1);
    let sig = SbpSignature::new()
        .with_arg("in", vec![sbp, sbp])
        .with_arg("out", vec![sbp]);
    job.add_op(conf, grid(), sig).expect("add add_n op");
}

pub fn add_sink(job: &mut Job, name: &str, input: Lbi, sbp: SbpParallel) {
    add_sink_at(job, name, input, sbp, grid());
}

pub fn add_sink_at(
    job: &mut Job,
    name: &str,
    input: Lbi,
    sbp: SbpParallel,
    parallel: ParallelDesc,
) {
    let conf = OperatorConf::new(name, "relay").with_input("in", vec![input]);
    let sig = SbpSignature::new().with_arg("in", vec![sbp]);
    job.add_op(conf, parallel, sig).expect("add sink op");
}

/// Conversion op: consumes `input` and re-emits it under `target`.
pub fn add_sbp_cast(job: &mut Job, name: &str, input: Lbi, target: SbpParallel) {
    add_sbp_cast_at(job, name, input, target, grid());
}

pub fn add_sbp_cast_at(
    job: &mut Job,
    name: &str,
    input: Lbi,
    target: SbpParallel,
    parallel: ParallelDesc,
) {
    let conf = OperatorConf::new(name, "sbp_cast")
        .with_input("in", vec![input])
        .with_output("out", 1)
        .with_attr("sbp", AttrValue::Sbp(target));
    let sig = SbpSignature::new()
        .with_arg("in", vec![target])
        .with_arg("out", vec![target]);
    job.add_op(conf, parallel, sig).expect("add sbp_cast op");
}

/// Drives one pass the way the pipeline does: snapshot, then apply, then commit.
pub fn run_pass(job: &mut Job, pass: &dyn JobPass) -> CommitSummary {
    let mut builder = JobBuilder::new();
    {
        let graph = OpGraph::new(job).expect("fixture job must be well formed");
        pass.apply(&graph, &mut builder).expect("pass must apply");
    }
    builder.commit(job).expect("commit must succeed")
}
