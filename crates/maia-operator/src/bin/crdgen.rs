use kube::core::CustomResourceExt;
use maia_operator::crds::{MaiaInstance, MaiaTenant};

fn main() {
    let crds = vec![MaiaInstance::crd(), MaiaTenant::crd()];
    for (i, crd) in crds.into_iter().enumerate() {
        if i > 0 {
            println!("---");
        }
        println!("{}", serde_yaml::to_string(&crd).expect("serialize crd"));
    }
}
