mod tests_criteria;
mod tests_search;
