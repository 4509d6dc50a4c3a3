use gc_controller::GarbageCollectionPolicy;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&GarbageCollectionPolicy::crd())?);
    Ok(())
}
