mod tests_build;
mod tests_corruption;
mod tests_manifest;
