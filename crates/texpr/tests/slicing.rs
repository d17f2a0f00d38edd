use texpr::expr::{ExprKind, SimpleRange, UnaryOp};
use texpr::{Expr, Range, Shape, ShapeError, SizeExpr};

fn rank3_shape() -> Shape {
    Shape::new([SizeExpr::sym("A"), SizeExpr::sym("B"), SizeExpr::sym("C")])
}

#[test]
fn span_new_axis_fill_lowers_to_reshape_of_subtensor() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", rank3_shape())).unwrap();
    let n = SizeExpr::sym("N");
    let end = &n - &SizeExpr::one();
    let e = x
        .slice(&[
            Range::Span(Some(SizeExpr::zero()), Some(end.clone())),
            Range::NewAxis,
            Range::Fill,
        ])
        .unwrap();

    // Shape: [N; broadcast; B; C] with the new axis right after axis 0.
    assert_eq!(e.shape().rank(), 4);
    assert_eq!(e.shape().dims()[0], n);
    assert!(e.shape().dims()[1].is_broadcast());
    assert_eq!(e.shape().dims()[2], SizeExpr::sym("B"));

    // Structure: Reshape(Subtensor([sym-start-sym-end])).
    let ExprKind::Unary {
        op: UnaryOp::Reshape(_),
        arg,
    } = e.node().kind()
    else {
        panic!("expected a reshape root");
    };
    let ExprKind::Unary {
        op: UnaryOp::Subtensor(spec),
        ..
    } = arg.kind()
    else {
        panic!("expected a subtensor under the reshape");
    };
    assert_eq!(spec.len(), 1);
    let SimpleRange::SymStartSymEnd { start, end: spec_end } = &spec[0] else {
        panic!("expected a symbolic span");
    };
    assert_eq!(*start, SizeExpr::zero());
    assert_eq!(spec_end.as_ref(), Some(&end));
}

#[test]
fn element_ranges_drop_their_axis() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", rank3_shape())).unwrap();
    let e = x.slice(&[Range::Elem(SizeExpr::fixed(1))]).unwrap();
    assert_eq!(
        e.shape(),
        &Shape::matrix(SizeExpr::sym("B"), SizeExpr::sym("C"))
    );
}

#[test]
fn pure_fill_is_the_identity() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", rank3_shape())).unwrap();
    let e = x.slice(&[Range::Fill]).unwrap();
    assert_eq!(e, x);
}

#[test]
fn open_span_keeps_the_axis_extent() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", rank3_shape())).unwrap();
    let e = x
        .slice(&[Range::Span(Some(SizeExpr::fixed(1)), None)])
        .unwrap();
    // [A - 1; B; C]
    let expected_len = &SizeExpr::sym("A") - &SizeExpr::fixed(1);
    assert_eq!(e.shape().dims()[0], expected_len);
}

#[test]
fn too_many_axis_arguments_fail() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec(
        "x",
        Shape::vector(SizeExpr::sym("A")),
    ))
    .unwrap();
    let all = Range::Span(None, None);
    assert!(matches!(
        x.slice(&[all.clone(), all]),
        Err(ShapeError::RankMismatch { .. })
    ));
}

#[test]
fn double_fill_is_rejected() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", rank3_shape())).unwrap();
    assert!(matches!(
        x.slice(&[Range::Fill, Range::Fill]),
        Err(ShapeError::RankMismatch { .. })
    ));
}
