//! Central finite-difference checks of the analytic gradients.
//!
//! Loss: C = sum(r * a) for a fixed weighting r, so dC/dz = r * phi'(z) is
//! known in closed form and seeds `backward` / `compute_gradient`.

use std::sync::Arc;

use convnet::*;

const EPS: f32 = 1e-2;

fn fill(buf: &mut [f32], scale: f32, phase: usize) {
    for (i, p) in buf.iter_mut().enumerate() {
        *p = (((i * 31 + phase * 17) % 23) as f32 / 23.0 - 0.5) * scale;
    }
}

fn weighting(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i % 7) as f32 - 3.0) * 0.25).collect()
}

fn loss(a: &Tensor, r: &[f32]) -> f64 {
    a.data()
        .iter()
        .zip(r)
        .map(|(&ak, &rk)| ak as f64 * rk as f64)
        .sum()
}

fn assert_close(num: f64, ana: f64, what: &str, i: usize) {
    assert!(
        (num - ana).abs() <= 2e-3 + 1e-2 * ana.abs(),
        "{what} {i}: numeric {num} vs analytic {ana}"
    );
}

fn seed_delta(z: &Tensor, r: &[f32], phi: Activation) -> Tensor {
    let mut delta = Tensor::new(z.shape());
    for ((dk, &zk), &rk) in delta.data_mut().iter_mut().zip(z.data()).zip(r) {
        *dk = rk * phi.deriv(zk);
    }
    delta
}

#[test]
fn inception_layer_gradients_match_finite_differences() {
    let backend: Arc<dyn Backend> = Arc::new(CpuBackend::new());
    let input = TensorInfo::new(2, 3, 3).unwrap();
    let info = InceptionInfo::new(1, 1, 1, 1, 1, 1).unwrap();
    let mut layer =
        InceptionLayer::new(input, info, Activation::Sigmoid, backend, &mut rand::rng()).unwrap();
    fill(layer.weights_mut(), 0.8, 1);
    fill(layer.biases_mut(), 0.4, 2);

    let mut x = Tensor::new(Shape::new(1, input).unwrap());
    fill(x.data_mut(), 1.2, 3);
    let r = weighting(layer.output().len());

    let (z, _) = layer.forward(x.view()).unwrap();
    let delta = seed_delta(&z, &r, Activation::Sigmoid);
    // z_prev = x with an identity previous activation, so backward returns
    // dC/dx directly.
    let dx = layer
        .backward(delta.view(), x.view(), Activation::Identity)
        .unwrap();
    let grads = layer
        .compute_gradient(x.view(), delta.view())
        .unwrap()
        .unwrap();

    // Input gradient: exercises all four branch contributions, including
    // the arg-max routing of the pooling branch.
    for i in 0..x.len() {
        let orig = x.data()[i];
        x.data_mut()[i] = orig + EPS;
        let (_, a_plus) = layer.forward(x.view()).unwrap();
        x.data_mut()[i] = orig - EPS;
        let (_, a_minus) = layer.forward(x.view()).unwrap();
        x.data_mut()[i] = orig;
        let num = (loss(&a_plus, &r) - loss(&a_minus, &r)) / (2.0 * EPS as f64);
        assert_close(num, dx.data()[i] as f64, "input", i);
    }

    // Weight gradients, across every partition stage.
    for i in 0..layer.weights().len() {
        let orig = layer.weights()[i];
        layer.weights_mut()[i] = orig + EPS;
        let (_, a_plus) = layer.forward(x.view()).unwrap();
        layer.weights_mut()[i] = orig - EPS;
        let (_, a_minus) = layer.forward(x.view()).unwrap();
        layer.weights_mut()[i] = orig;
        let num = (loss(&a_plus, &r) - loss(&a_minus, &r)) / (2.0 * EPS as f64);
        assert_close(num, grads.dw[i] as f64, "weight", i);
    }

    // Bias gradients.
    for i in 0..layer.biases().len() {
        let orig = layer.biases()[i];
        layer.biases_mut()[i] = orig + EPS;
        let (_, a_plus) = layer.forward(x.view()).unwrap();
        layer.biases_mut()[i] = orig - EPS;
        let (_, a_minus) = layer.forward(x.view()).unwrap();
        layer.biases_mut()[i] = orig;
        let num = (loss(&a_plus, &r) - loss(&a_minus, &r)) / (2.0 * EPS as f64);
        assert_close(num, grads.db[i] as f64, "bias", i);
    }
}

#[test]
fn dense_layer_gradients_match_finite_differences() {
    let mut layer = DenseLayer::new(
        TensorInfo::linear(4).unwrap(),
        3,
        Activation::Sigmoid,
        &mut rand::rng(),
    )
    .unwrap();
    fill(layer.weights_mut(), 0.9, 5);
    fill(layer.biases_mut(), 0.3, 6);

    let mut x = Tensor::new(Shape::matrix(2, 4).unwrap());
    fill(x.data_mut(), 1.0, 7);
    let r = weighting(2 * 3);

    let (z, _) = layer.forward(x.view()).unwrap();
    let delta = seed_delta(&z, &r, Activation::Sigmoid);
    let dx = layer
        .backward(delta.view(), x.view(), Activation::Identity)
        .unwrap();
    let grads = layer
        .compute_gradient(x.view(), delta.view())
        .unwrap()
        .unwrap();

    for i in 0..x.len() {
        let orig = x.data()[i];
        x.data_mut()[i] = orig + EPS;
        let (_, a_plus) = layer.forward(x.view()).unwrap();
        x.data_mut()[i] = orig - EPS;
        let (_, a_minus) = layer.forward(x.view()).unwrap();
        x.data_mut()[i] = orig;
        let num = (loss(&a_plus, &r) - loss(&a_minus, &r)) / (2.0 * EPS as f64);
        assert_close(num, dx.data()[i] as f64, "input", i);
    }
    for i in 0..layer.weights().len() {
        let orig = layer.weights()[i];
        layer.weights_mut()[i] = orig + EPS;
        let (_, a_plus) = layer.forward(x.view()).unwrap();
        layer.weights_mut()[i] = orig - EPS;
        let (_, a_minus) = layer.forward(x.view()).unwrap();
        layer.weights_mut()[i] = orig;
        let num = (loss(&a_plus, &r) - loss(&a_minus, &r)) / (2.0 * EPS as f64);
        assert_close(num, grads.dw[i] as f64, "weight", i);
    }
    for i in 0..layer.biases().len() {
        let orig = layer.biases()[i];
        layer.biases_mut()[i] = orig + EPS;
        let (_, a_plus) = layer.forward(x.view()).unwrap();
        layer.biases_mut()[i] = orig - EPS;
        let (_, a_minus) = layer.forward(x.view()).unwrap();
        layer.biases_mut()[i] = orig;
        let num = (loss(&a_plus, &r) - loss(&a_minus, &r)) / (2.0 * EPS as f64);
        assert_close(num, grads.db[i] as f64, "bias", i);
    }
}
