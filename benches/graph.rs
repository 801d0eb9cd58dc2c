use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use funcdesign::{
    testing::{ExtendedRosenbrock, Exponential, Model, TestModel},
    DiffOptions, Graph, Sparsity,
};

fn eval_fresh(c: &mut Criterion, label: &str, model: &dyn TestModel) {
    let graph = Graph::new();
    let built = model.build(&graph);
    let x = model.initials().remove(0);

    c.bench_function(&format!("eval {}", label), |b| {
        b.iter_batched(
            || built.point(&x),
            |point| built.objective.eval(&point).unwrap(),
            BatchSize::SmallInput,
        )
    });
}

fn diff_fresh(c: &mut Criterion, label: &str, model: &dyn TestModel, sparsity: Sparsity) {
    let graph = Graph::new();
    let built = model.build(&graph);
    let x = model.initials().remove(0);
    let options = DiffOptions::new().with_sparsity(sparsity);

    c.bench_function(&format!("diff {} {:?}", label, sparsity), |b| {
        b.iter_batched(
            || built.point(&x),
            |point| built.objective.diff_with(&point, &options).unwrap(),
            BatchSize::SmallInput,
        )
    });
}

fn refine(c: &mut Criterion, label: &str, built: &Model<'_>) {
    let root = built.domain(-2.0, 2.0);
    built.objective.interval(&root).unwrap();
    let var = built.vars[0];

    c.bench_function(&format!("interval refine {}", label), |b| {
        b.iter(|| {
            let child = root.refine(&var, 0.0, 1.0);
            built.objective.interval(&child).unwrap()
        })
    });
}

fn rosenbrock(c: &mut Criterion) {
    let model = ExtendedRosenbrock::new(200);
    eval_fresh(c, "rosenbrock 200", &model);
    diff_fresh(c, "rosenbrock 200", &model, Sparsity::Never);
    diff_fresh(c, "rosenbrock 200", &model, Sparsity::Auto);

    let graph = Graph::new();
    let built = model.build(&graph);
    refine(c, "rosenbrock 200", &built);
}

fn exponential(c: &mut Criterion) {
    let model = Exponential::new(50);
    eval_fresh(c, "exponential 50", &model);
    diff_fresh(c, "exponential 50", &model, Sparsity::Never);
}

criterion_group!(benches, rosenbrock, exponential);
criterion_main!(benches);
