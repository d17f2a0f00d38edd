use std::sync::Arc;

use texpr::{Expr, ExtensionLowering, ExtensionOp, Shape, ShapeError, SizeExpr};

fn nm_shape() -> Shape {
    Shape::matrix(SizeExpr::sym("N"), SizeExpr::sym("M"))
}

#[test]
fn elementwise_binaries_broadcast_to_the_wider_operand() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", nm_shape())).unwrap();
    let y = Expr::<f32>::var(Expr::<f32>::var_spec("y", Shape::vector(SizeExpr::sym("M"))))
        .unwrap();
    let sum = x.try_add(&y).unwrap();
    assert_eq!(sum.shape(), &nm_shape());
    sum.check().unwrap();
}

#[test]
fn scalar_operands_broadcast_everywhere() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", nm_shape())).unwrap();
    let two = Expr::<f32>::scalar(2.0);
    let scaled = x.try_mul(&two).unwrap();
    assert_eq!(scaled.shape(), &nm_shape());
}

#[test]
fn incompatible_shapes_are_rejected() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec(
        "x",
        Shape::vector(SizeExpr::fixed(3)),
    ))
    .unwrap();
    let y = Expr::<f32>::var(Expr::<f32>::var_spec(
        "y",
        Shape::vector(SizeExpr::fixed(4)),
    ))
    .unwrap();
    assert!(matches!(
        x.try_add(&y),
        Err(ShapeError::ShapeMismatch { .. })
    ));
}

#[test]
fn dot_shape_rules() {
    let n = SizeExpr::sym("N");
    let k = SizeExpr::sym("K");
    let m = SizeExpr::sym("M");
    let a = Expr::<f32>::var(Expr::<f32>::var_spec(
        "a",
        Shape::matrix(n.clone(), k.clone()),
    ))
    .unwrap();
    let b = Expr::<f32>::var(Expr::<f32>::var_spec(
        "b",
        Shape::matrix(k.clone(), m.clone()),
    ))
    .unwrap();
    let v = Expr::<f32>::var(Expr::<f32>::var_spec("v", Shape::vector(k.clone()))).unwrap();

    assert_eq!(a.dot(&b).unwrap().shape(), &Shape::matrix(n.clone(), m));
    assert_eq!(a.dot(&v).unwrap().shape(), &Shape::vector(n));
    assert_eq!(v.dot(&v).unwrap().shape(), &Shape::scalar());
}

#[test]
fn dot_rejects_bad_ranks_and_inner_dims() {
    let cube = Expr::<f32>::var(Expr::<f32>::var_spec(
        "c",
        Shape::new([SizeExpr::fixed(2), SizeExpr::fixed(2), SizeExpr::fixed(2)]),
    ))
    .unwrap();
    assert!(matches!(
        cube.dot(&cube),
        Err(ShapeError::RankMismatch { .. })
    ));

    let a = Expr::<f32>::var(Expr::<f32>::var_spec(
        "a",
        Shape::matrix(SizeExpr::fixed(2), SizeExpr::fixed(3)),
    ))
    .unwrap();
    let b = Expr::<f32>::var(Expr::<f32>::var_spec(
        "b",
        Shape::matrix(SizeExpr::fixed(4), SizeExpr::fixed(2)),
    ))
    .unwrap();
    assert!(matches!(a.dot(&b), Err(ShapeError::ShapeMismatch { .. })));
}

#[test]
fn swap_dim_bounds_are_checked() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", nm_shape())).unwrap();
    let swapped = x.swap_dim(0, 1).unwrap();
    assert_eq!(
        swapped.shape(),
        &Shape::matrix(SizeExpr::sym("M"), SizeExpr::sym("N"))
    );
    assert!(matches!(
        x.swap_dim(0, 2),
        Err(ShapeError::RankMismatch { .. })
    ));
}

#[test]
fn reshape_requires_equal_element_counts() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", nm_shape())).unwrap();
    let flat = Shape::vector(&SizeExpr::sym("N") * &SizeExpr::sym("M"));
    assert!(x.reshape(flat).is_ok());
    assert!(matches!(
        x.reshape(Shape::vector(SizeExpr::sym("N"))),
        Err(ShapeError::RankMismatch { .. })
    ));
}

#[test]
fn reshape_round_trips_collapse() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec(
        "x",
        Shape::matrix(SizeExpr::fixed(2), SizeExpr::fixed(6)),
    ))
    .unwrap();
    let s1 = Shape::matrix(SizeExpr::fixed(3), SizeExpr::fixed(4));
    let s2 = Shape::vector(SizeExpr::fixed(12));
    let twice = x.reshape(s2).unwrap().reshape(s1.clone()).unwrap();
    let once = x.reshape(s1).unwrap();
    assert_eq!(twice, once);
}

#[test]
fn broadcast_to_own_shape_is_the_identity() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", nm_shape())).unwrap();
    let same = x.do_broadcast(x.shape().clone()).unwrap();
    assert_eq!(same, x);
}

#[test]
fn store_to_var_checks_shape_and_dtype() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", nm_shape())).unwrap();
    let ok = x.store_to(Expr::<f32>::var_spec("out", nm_shape())).unwrap();
    assert_eq!(ok.shape(), &Shape::scalar());

    let bad_shape = Expr::<f32>::var_spec("out", Shape::vector(SizeExpr::sym("N")));
    assert!(matches!(
        x.store_to(bad_shape),
        Err(ShapeError::ShapeMismatch { .. })
    ));

    let bad_dtype = Expr::<f64>::var_spec("out", nm_shape());
    assert!(matches!(
        x.store_to(bad_dtype),
        Err(ShapeError::DTypeMismatch { .. })
    ));
}

#[test]
fn identity_and_reductions() {
    let eye = Expr::<f64>::identity(SizeExpr::sym("N"));
    assert_eq!(
        eye.shape(),
        &Shape::matrix(SizeExpr::sym("N"), SizeExpr::sym("N"))
    );

    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", nm_shape())).unwrap();
    assert_eq!(x.sum().shape(), &Shape::scalar());
    assert_eq!(
        x.sum_axis(0).unwrap().shape(),
        &Shape::vector(SizeExpr::sym("M"))
    );
    assert!(matches!(
        x.sum_axis(2),
        Err(ShapeError::RankMismatch { .. })
    ));
}

#[test]
fn tensor_product_concatenates_dims() {
    let a = Expr::<f32>::var(Expr::<f32>::var_spec(
        "a",
        Shape::vector(SizeExpr::sym("N")),
    ))
    .unwrap();
    let b = Expr::<f32>::var(Expr::<f32>::var_spec(
        "b",
        Shape::vector(SizeExpr::sym("M")),
    ))
    .unwrap();
    let outer = a.tensor_product(&b).unwrap();
    assert_eq!(outer.shape(), &nm_shape());
}

#[test]
fn check_is_idempotent() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", nm_shape())).unwrap();
    let e = x.tanh().try_mul(&x).unwrap().sum();
    e.check().unwrap();
    e.check().unwrap();
}

#[derive(Debug)]
struct Softsign;

impl ExtensionOp for Softsign {
    fn name(&self) -> &str {
        "softsign"
    }

    fn arity(&self) -> usize {
        1
    }

    fn shape_of(&self, args: &[Shape]) -> Result<Shape, ShapeError> {
        Ok(args[0].clone())
    }

    fn lowering(&self) -> ExtensionLowering {
        ExtensionLowering::DeviceKernel {
            func_name: "softsign".to_string(),
        }
    }
}

#[test]
fn extension_ops_declare_arity_and_shape() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", nm_shape())).unwrap();
    let op: Arc<dyn ExtensionOp> = Arc::new(Softsign);

    let applied = Expr::extension(Arc::clone(&op), &[x.clone()]).unwrap();
    assert_eq!(applied.shape(), &nm_shape());
    applied.check().unwrap();

    let err = Expr::extension(op, &[x.clone(), x]).unwrap_err();
    assert!(matches!(
        err,
        ShapeError::UnsupportedOp {
            expected: 1,
            actual: 2,
            ..
        }
    ));
}

#[test]
fn operator_sugar_matches_builders() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", nm_shape())).unwrap();
    let y = Expr::<f32>::var(Expr::<f32>::var_spec("y", nm_shape())).unwrap();
    assert_eq!(&x + &y, x.try_add(&y).unwrap());
    assert_eq!(&x - &y, x.try_sub(&y).unwrap());
    assert_eq!(-&x, x.negate());
}
